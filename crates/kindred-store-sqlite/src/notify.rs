//! Change notifications: accumulated during a write transaction, flushed to
//! subscribers only on commit. Rollback clears the accumulator, so no
//! partial state is ever announced.

use std::{
  collections::BTreeSet,
  sync::Mutex,
};

use tokio::sync::broadcast;

/// Post-commit notifications. Payloads are ids only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeNotification {
  /// Display-label group membership may have changed (new group seen, or
  /// groups regenerated for a new locale).
  DisplayLabelGroupsChanged,
  CollectionsAdded(Vec<i64>),
  CollectionsChanged(Vec<i64>),
  ContactsAdded(Vec<i64>),
  ContactsChanged(Vec<i64>),
  ContactsPresenceChanged(Vec<i64>),
  /// Collections whose contents changed in a way relevant to their sync
  /// adapter. Collections currently being written *by* a sync adapter are
  /// suppressed, so the adapter never sees its own deltas echoed back.
  SyncCollectionsChanged(Vec<i64>),
  ContactsRemoved(Vec<i64>),
  CollectionsRemoved(Vec<i64>),
}

#[derive(Default)]
struct Pending {
  display_label_groups_changed: bool,
  collections_added:            BTreeSet<i64>,
  collections_changed:          BTreeSet<i64>,
  contacts_added:               BTreeSet<i64>,
  contacts_changed:             BTreeSet<i64>,
  contacts_presence_changed:    BTreeSet<i64>,
  sync_collections_changed:     BTreeSet<i64>,
  contacts_removed:             BTreeSet<i64>,
  collections_removed:          BTreeSet<i64>,
  suppressed_collections:       BTreeSet<i64>,
}

pub(crate) struct Notifier {
  pending: Mutex<Pending>,
  sender:  broadcast::Sender<ChangeNotification>,
}

impl Notifier {
  pub fn new() -> Self {
    let (sender, _) = broadcast::channel(256);
    Self { pending: Mutex::new(Pending::default()), sender }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
    self.sender.subscribe()
  }

  fn with<T>(&self, f: impl FnOnce(&mut Pending) -> T) -> T {
    let mut guard = self.pending.lock().unwrap_or_else(|e| e.into_inner());
    f(&mut guard)
  }

  pub fn note_display_label_groups_changed(&self) {
    self.with(|p| p.display_label_groups_changed = true);
  }

  pub fn note_collection_added(&self, id: i64) {
    self.with(|p| p.collections_added.insert(id));
  }

  pub fn note_collection_changed(&self, id: i64) {
    self.with(|p| p.collections_changed.insert(id));
  }

  pub fn note_collection_removed(&self, id: i64) {
    self.with(|p| p.collections_removed.insert(id));
  }

  pub fn note_contact_added(&self, id: i64) {
    self.with(|p| p.contacts_added.insert(id));
  }

  pub fn note_contact_changed(&self, id: i64) {
    self.with(|p| p.contacts_changed.insert(id));
  }

  pub fn note_contact_presence_changed(&self, id: i64) {
    self.with(|p| p.contacts_presence_changed.insert(id));
  }

  pub fn note_contact_removed(&self, id: i64) {
    self.with(|p| p.contacts_removed.insert(id));
  }

  pub fn note_sync_collection_changed(&self, collection_id: i64) {
    self.with(|p| p.sync_collections_changed.insert(collection_id));
  }

  /// Suppress sync-change echo for `collection_id` until the accumulator is
  /// next drained or cleared.
  pub fn suppress_collection(&self, collection_id: i64) {
    self.with(|p| p.suppressed_collections.insert(collection_id));
  }

  /// Drop everything accumulated; called on rollback.
  pub fn clear(&self) {
    self.with(|p| *p = Pending::default());
  }

  /// Emit accumulated notifications in the fixed category order, then
  /// reset. Send failures mean no subscriber is listening; ignored.
  pub fn flush(&self) {
    let pending = self.with(std::mem::take);

    let mut emit = |n: ChangeNotification| {
      let _ = self.sender.send(n);
    };

    if pending.display_label_groups_changed {
      emit(ChangeNotification::DisplayLabelGroupsChanged);
    }
    if !pending.collections_added.is_empty() {
      emit(ChangeNotification::CollectionsAdded(
        pending.collections_added.iter().copied().collect(),
      ));
    }
    if !pending.collections_changed.is_empty() {
      emit(ChangeNotification::CollectionsChanged(
        pending.collections_changed.iter().copied().collect(),
      ));
    }
    if !pending.contacts_added.is_empty() {
      emit(ChangeNotification::ContactsAdded(
        pending.contacts_added.iter().copied().collect(),
      ));
    }
    if !pending.contacts_changed.is_empty() {
      emit(ChangeNotification::ContactsChanged(
        pending.contacts_changed.iter().copied().collect(),
      ));
    }
    if !pending.contacts_presence_changed.is_empty() {
      emit(ChangeNotification::ContactsPresenceChanged(
        pending.contacts_presence_changed.iter().copied().collect(),
      ));
    }
    let sync_changed: Vec<i64> = pending
      .sync_collections_changed
      .iter()
      .filter(|id| !pending.suppressed_collections.contains(id))
      .copied()
      .collect();
    if !sync_changed.is_empty() {
      emit(ChangeNotification::SyncCollectionsChanged(sync_changed));
    }
    if !pending.contacts_removed.is_empty() {
      emit(ChangeNotification::ContactsRemoved(
        pending.contacts_removed.iter().copied().collect(),
      ));
    }
    if !pending.collections_removed.is_empty() {
      emit(ChangeNotification::CollectionsRemoved(
        pending.collections_removed.iter().copied().collect(),
      ));
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn flush_emits_in_category_order_and_resets() {
    let notifier = Notifier::new();
    let mut rx = notifier.subscribe();

    notifier.note_contact_removed(5);
    notifier.note_contact_added(3);
    notifier.note_collection_added(7);
    notifier.flush();

    assert_eq!(
      rx.try_recv().unwrap(),
      ChangeNotification::CollectionsAdded(vec![7])
    );
    assert_eq!(
      rx.try_recv().unwrap(),
      ChangeNotification::ContactsAdded(vec![3])
    );
    assert_eq!(
      rx.try_recv().unwrap(),
      ChangeNotification::ContactsRemoved(vec![5])
    );
    assert!(rx.try_recv().is_err());

    // Second flush emits nothing.
    notifier.flush();
    assert!(rx.try_recv().is_err());
  }

  #[test]
  fn suppressed_collections_are_not_echoed() {
    let notifier = Notifier::new();
    let mut rx = notifier.subscribe();

    notifier.note_sync_collection_changed(4);
    notifier.note_sync_collection_changed(9);
    notifier.suppress_collection(9);
    notifier.flush();

    assert_eq!(
      rx.try_recv().unwrap(),
      ChangeNotification::SyncCollectionsChanged(vec![4])
    );
  }

  #[test]
  fn clear_drops_pending() {
    let notifier = Notifier::new();
    let mut rx = notifier.subscribe();

    notifier.note_contact_added(1);
    notifier.clear();
    notifier.flush();
    assert!(rx.try_recv().is_err());
  }
}

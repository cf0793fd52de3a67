//! Display labels and display-label groups.
//!
//! The label string itself is synthesised from name parts (or fallbacks);
//! the *group* is a short bucket tag (a letter, `#`, or `?`) produced by a
//! locale-aware generator. Generators are consulted in descending priority
//! until one yields a group; the default A–Z/`#`/`?` generator is the
//! terminal fallback and is always valid.

use std::collections::BTreeMap;

use crate::{
  contact::Contact,
  detail::{DetailData, DetailKind},
};

// ─── Generator contract ──────────────────────────────────────────────────────

/// A locale-specific display-label-group generator.
pub trait DisplayLabelGroupGenerator: Send + Sync {
  fn name(&self) -> &str;
  /// Generators are consulted in descending priority order.
  fn priority(&self) -> i32;
  fn valid_for_locale(&self, locale: &str) -> bool;
  fn preferred_for_locale(&self, locale: &str) -> bool;
  /// All groups this generator can produce, in display order.
  fn display_label_groups(&self) -> Vec<String>;
  /// The group for a piece of label text, or `None` to defer to the next
  /// generator.
  fn display_label_group(&self, text: &str) -> Option<String>;
}

// ─── Default generator ───────────────────────────────────────────────────────

/// Fallback generator: `A`–`Z` for latin letters, `#` for digits, `?`
/// otherwise. Never preferred, always valid.
pub struct DefaultGroupGenerator;

impl DisplayLabelGroupGenerator for DefaultGroupGenerator {
  fn name(&self) -> &str { "default" }

  fn priority(&self) -> i32 { 0 }

  fn valid_for_locale(&self, _locale: &str) -> bool { true }

  fn preferred_for_locale(&self, _locale: &str) -> bool { false }

  fn display_label_groups(&self) -> Vec<String> {
    let mut groups: Vec<String> =
      ('A'..='Z').map(|c| c.to_string()).collect();
    groups.push("#".to_owned());
    groups.push("?".to_owned());
    groups
  }

  fn display_label_group(&self, text: &str) -> Option<String> {
    let first = text.chars().next()?;
    let upper = first.to_ascii_uppercase();
    if upper.is_ascii_uppercase() {
      Some(upper.to_string())
    } else if first.is_ascii_digit() {
      Some("#".to_owned())
    } else {
      Some("?".to_owned())
    }
  }
}

// ─── Group sort values ───────────────────────────────────────────────────────

/// Sort value forced for the `#` group, above every positional value.
pub const NUMBER_GROUP_SORT_VALUE: i64 = 0x10FFFF;
/// Sort value forced for the `?` group.
pub const OTHER_GROUP_SORT_VALUE: i64 = NUMBER_GROUP_SORT_VALUE + 1;

/// Known groups mapped to stable sort values: positions in the concatenated
/// group lists of all applicable generators, with `#` and `?` pinned to the
/// top of the range.
pub fn known_group_sort_values(
  generators: &[&dyn DisplayLabelGroupGenerator],
  locale: &str,
) -> BTreeMap<String, i64> {
  let mut known = BTreeMap::new();
  let mut position: i64 = 0;
  for generator in generators {
    if !generator.valid_for_locale(locale) {
      continue;
    }
    for group in generator.display_label_groups() {
      known.entry(group).or_insert_with(|| {
        let value = position;
        position += 1;
        value
      });
    }
  }
  known.insert("#".to_owned(), NUMBER_GROUP_SORT_VALUE);
  known.insert("?".to_owned(), OTHER_GROUP_SORT_VALUE);
  known
}

/// The sort value for `group`. Groups first seen at write time all collapse
/// into `max(known positional values) + 2`, so that relative ordering never
/// depends on which unknown group happened to be written first.
pub fn group_sort_value(group: &str, known: &BTreeMap<String, i64>) -> i64 {
  match group {
    "#" => NUMBER_GROUP_SORT_VALUE,
    "?" => OTHER_GROUP_SORT_VALUE,
    _ => {
      if let Some(value) = known.get(group) {
        return *value;
      }
      let max_positional = known
        .values()
        .copied()
        .filter(|v| *v < NUMBER_GROUP_SORT_VALUE)
        .max()
        .unwrap_or(-1);
      max_positional + 2
    }
  }
}

/// Pick the group for `text` by consulting `generators` (already filtered
/// to the locale and sorted by descending priority) in turn.
pub fn group_for_text(
  generators: &[&dyn DisplayLabelGroupGenerator],
  locale: &str,
  text: &str,
) -> String {
  for generator in generators {
    if !generator.valid_for_locale(locale) {
      continue;
    }
    if let Some(group) = generator.display_label_group(text) {
      return group;
    }
  }
  DefaultGroupGenerator
    .display_label_group(text)
    .unwrap_or_else(|| "?".to_owned())
}

// ─── Label synthesis ─────────────────────────────────────────────────────────

/// Synthesise the display-label string for a contact: custom label, then
/// composed name, then nickname, organisation, email, online account, and
/// finally phone number.
pub fn synthesize_display_label(contact: &Contact) -> Option<String> {
  if let Some(detail) = contact.single_detail(DetailKind::Name)
    && let DetailData::Name(name) = &detail.data
  {
    if let Some(label) = non_empty(name.custom_label.as_deref()) {
      return Some(label);
    }
    let composed = [name.first.as_deref(), name.last.as_deref()]
      .into_iter()
      .flatten()
      .filter(|part| !part.is_empty())
      .collect::<Vec<_>>()
      .join(" ");
    if !composed.is_empty() {
      return Some(composed);
    }
  }

  for detail in &contact.details {
    match &detail.data {
      DetailData::Nickname(nick) if !nick.is_empty() => {
        return Some(nick.clone());
      }
      _ => {}
    }
  }
  for detail in &contact.details {
    if let DetailData::Organization(org) = &detail.data
      && let Some(name) = non_empty(org.name.as_deref())
    {
      return Some(name);
    }
  }
  for detail in &contact.details {
    match &detail.data {
      DetailData::EmailAddress(address) if !address.is_empty() => {
        return Some(address.clone());
      }
      _ => {}
    }
  }
  for detail in &contact.details {
    if let DetailData::OnlineAccount(account) = &detail.data
      && !account.account_uri.is_empty()
    {
      return Some(account.account_uri.clone());
    }
  }
  for detail in &contact.details {
    if let DetailData::PhoneNumber(phone) = &detail.data
      && !phone.number.is_empty()
    {
      return Some(phone.number.clone());
    }
  }
  None
}

fn non_empty(s: Option<&str>) -> Option<String> {
  s.filter(|s| !s.is_empty()).map(str::to_owned)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    contact::LOCAL_COLLECTION_ID,
    detail::{NameData, OrganizationData},
  };

  #[test]
  fn default_generator_buckets() {
    let g = DefaultGroupGenerator;
    assert_eq!(g.display_label_group("smith").as_deref(), Some("S"));
    assert_eq!(g.display_label_group("7-eleven").as_deref(), Some("#"));
    assert_eq!(g.display_label_group("毛").as_deref(), Some("?"));
    assert_eq!(g.display_label_group(""), None);
  }

  #[test]
  fn sort_values_pin_number_and_other_groups() {
    let default = DefaultGroupGenerator;
    let generators: Vec<&dyn DisplayLabelGroupGenerator> = vec![&default];
    let known = known_group_sort_values(&generators, "en_US");

    assert_eq!(group_sort_value("A", &known), 0);
    assert_eq!(group_sort_value("Z", &known), 25);
    assert_eq!(group_sort_value("#", &known), NUMBER_GROUP_SORT_VALUE);
    assert_eq!(group_sort_value("?", &known), OTHER_GROUP_SORT_VALUE);

    // Unknown groups all collapse into the same slot past the known range.
    assert_eq!(group_sort_value("Ω", &known), 27);
    assert_eq!(group_sort_value("Б", &known), 27);
  }

  #[test]
  fn label_synthesis_prefers_name_parts() {
    let mut c = Contact::new(LOCAL_COLLECTION_ID);
    c.push_detail(DetailData::Organization(OrganizationData {
      name: Some("Acme".into()),
      ..Default::default()
    }));
    assert_eq!(synthesize_display_label(&c).as_deref(), Some("Acme"));

    c.push_detail(DetailData::Name(NameData {
      first: Some("Alice".into()),
      last: Some("Liddell".into()),
      ..Default::default()
    }));
    assert_eq!(
      synthesize_display_label(&c).as_deref(),
      Some("Alice Liddell")
    );
  }
}

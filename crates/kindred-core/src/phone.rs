//! Phone-number normalisation.
//!
//! Treated by the rest of the engine as an opaque pure function: the same
//! routine runs at write time (to populate the `normalizedNumber` column)
//! and at filter compile time, so both sides of a comparison agree.

/// Characters that carry no dialling information and are stripped outright.
const FORMATTING_CHARS: &[char] = &[' ', '-', '.', '(', ')', '/', '\u{a0}'];

/// Normalise a phone number for comparison: keep a leading `+`, digits, and
/// DTMF control characters; drop visual formatting. Returns an empty string
/// when no dialable content remains, which callers treat as unparseable.
///
/// Idempotent: `normalize_phone_number(normalize_phone_number(x)) ==
/// normalize_phone_number(x)`.
pub fn normalize_phone_number(input: &str) -> String {
  let mut out = String::with_capacity(input.len());
  let mut has_digit = false;

  for (index, ch) in input.trim().chars().enumerate() {
    match ch {
      '+' if index == 0 => out.push('+'),
      '0'..='9' => {
        has_digit = true;
        out.push(ch);
      }
      '*' | '#' | 'p' | 'P' | 'w' | 'W' | 'x' | 'X' => {
        out.push(ch.to_ascii_lowercase());
      }
      c if FORMATTING_CHARS.contains(&c) => {}
      // Any other character makes the number unparseable.
      _ => return String::new(),
    }
  }

  if has_digit { out } else { String::new() }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn strips_formatting() {
    assert_eq!(normalize_phone_number("+1 (555) 010-0199"), "+15550100199");
    assert_eq!(normalize_phone_number("555.0100"), "5550100");
  }

  #[test]
  fn keeps_dtmf_controls() {
    assert_eq!(normalize_phone_number("5550100p12#"), "5550100p12#");
  }

  #[test]
  fn unparseable_yields_empty() {
    assert_eq!(normalize_phone_number("not a number"), "");
    assert_eq!(normalize_phone_number(""), "");
    assert_eq!(normalize_phone_number("+"), "");
  }

  #[test]
  fn idempotent() {
    for input in ["+1 (555) 010-0199", "555 0100 x 12", "garbage!"] {
      let once = normalize_phone_number(input);
      assert_eq!(normalize_phone_number(&once), once);
    }
  }
}

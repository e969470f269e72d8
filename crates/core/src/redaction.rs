//! Secret masking for log and terminal output

use std::fmt;

/// Replacement for redacted text
pub const MASK: &str = "****";

/// Mask a secret, keeping its first and last two characters when it is
/// longer than four characters
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 4 {
        return MASK.to_string();
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{}{}{}", head, MASK, tail)
}

/// Replace every occurrence of each non-empty secret in `text`
pub fn redact(text: &str, secrets: &[&str]) -> String {
    secrets
        .iter()
        .filter(|s| !s.is_empty())
        .fold(text.to_string(), |acc, secret| acc.replace(secret, MASK))
}

/// `Display` wrapper that prints a secret masked
#[derive(Clone, Copy)]
pub struct Masked<'a>(pub &'a str);

impl fmt::Display for Masked<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&mask_secret(self.0))
    }
}

impl fmt::Debug for Masked<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", mask_secret(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret(""), "****");
        assert_eq!(mask_secret("abcd"), "****");
        assert_eq!(mask_secret("abcde"), "ab****de");
        assert_eq!(mask_secret("Sw0rdFish!"), "Sw****h!");
        assert_eq!(mask_secret("pässwörd"), "pä****rd");
    }

    #[test]
    fn test_redact_replaces_all_occurrences() {
        let text = "Generated admin password: hunter22\nagain hunter22";
        assert_eq!(
            redact(text, &["hunter22", ""]),
            "Generated admin password: ****\nagain ****"
        );
    }

    #[test]
    fn test_masked_display_and_debug() {
        assert_eq!(Masked("Sw0rdFish!").to_string(), "Sw****h!");
        assert_eq!(format!("{:?}", Masked("abc")), "\"****\"");
    }
}

/// Canonical form of a collection-bin code as printed on the bin markers:
/// `trash-bin 3`, `TRASHBIN3` and `3` all become `TRASH_BIN_03`. Other codes
/// are only upper-cased with dashes and spaces folded. Blank input is `None`.
pub fn normalize_bin_code(raw: &str) -> Option<String> {
    let code = raw.trim().to_uppercase().replace('-', "_").replace(' ', "");
    if code.is_empty() {
        return None;
    }

    let digits_len = code.bytes().rev().take_while(u8::is_ascii_digit).count();
    let digits = &code[code.len() - digits_len..];
    let numbered = digits_len == code.len()
        || code.starts_with("TRASHBIN")
        || code.starts_with("TRASH_BIN");

    if digits_len > 0 && numbered {
        if let Ok(number) = digits.parse::<u64>() {
            return Some(format!("TRASH_BIN_{number:02}"));
        }
    }
    Some(code)
}

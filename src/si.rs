//! SI-prefix formatting and small string helpers (SPEC_FULL.md §4.7, §9).
//!
//! Ported from `original_source/src/pv/string.c` and the `pv__si_prefix`/`pv__sizestr`
//! helpers in `original_source/src/pv/display.c`.

/// What kind of count a value represents, driving both the divisor and the suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountType {
    Bytes,
    DecimalBytes,
    Lines,
}

/// Per SPEC_FULL.md §9's resolved open question: `K` (binary, ratio 1024) for bytes,
/// `k` (decimal, ratio 1000) for lines and decimal-byte display.
const PFX_1000: &[u8] = b"yzafpnum kMGTPEZY";
const PFX_1024: &[u8] = b"yzafpnum KMGTPEZY";

/// Divides or multiplies `value` by `ratio` until it falls in `[1.0, ratio)`, returning
/// the chosen SI prefix character (or `' '` for no prefix). Mirrors `pv__si_prefix`.
pub fn si_prefix(value: &mut f64, count_type: CountType) -> char {
    let ratio: f64 = if count_type == CountType::Bytes { 1024.0 } else { 1000.0 };
    let table: &[u8] = if count_type == CountType::Bytes { PFX_1024 } else { PFX_1000 };
    let mid = table.iter().position(|&b| b == b' ').expect("prefix table has a blank middle");

    if value.abs() < 0.00000001 {
        return ' ';
    }

    let cutoff = ratio * 0.97;
    let mut idx = mid as isize;

    if *value > 0.0 {
        while *value > cutoff && (idx as usize + 1) < table.len() {
            idx += 1;
            *value /= ratio;
        }
        while *value < 1.0 && idx > 0 {
            idx -= 1;
            *value *= ratio;
        }
    } else {
        let neg_cutoff = -cutoff;
        while *value < neg_cutoff && (idx as usize + 1) < table.len() {
            idx += 1;
            *value /= ratio;
        }
        while *value > -1.0 && idx > 0 {
            idx -= 1;
            *value *= ratio;
        }
    }

    table[idx as usize] as char
}

/// Formats `amount` as 3-4 significant digits plus an SI prefix and a unit suffix.
/// `suffix_basic` is used for non-byte counts, `suffix_bytes` for byte counts (which get
/// the two-character "Ki"/"Mi" form rather than "k"/"M").
pub fn sizestr(amount: f64, suffix_basic: &str, suffix_bytes: &str, count_type: CountType) -> String {
    let suffix = match count_type {
        CountType::Bytes | CountType::DecimalBytes => suffix_bytes,
        CountType::Lines => suffix_basic,
    };

    let mut display_amount = amount;
    let prefix = si_prefix(&mut display_amount, count_type);

    let prefix_str = if count_type == CountType::Bytes && prefix != ' ' {
        format!("{}i", prefix)
    } else if count_type == CountType::Bytes {
        "  ".to_string()
    } else {
        prefix.to_string()
    };

    if display_amount >= 99.9 {
        format!("{:4}{}{}", display_amount.round() as i64, prefix_str, suffix)
    } else {
        format!("{:>4.3}{}{}", display_amount, prefix_str, suffix)
    }
}

/// Truncates or pads `s` to exactly `width` display columns (byte-width approximation;
/// pv assumes a single-byte-per-column locale as the original C implementation does).
pub fn fit_width(s: &str, width: usize) -> String {
    let mut out: String = s.chars().take(width).collect();
    while out.len() < width {
        out.push(' ');
    }
    out
}

/// Replaces non-printable bytes with `.` (used by the last-written and previous-line
/// formatters), mirroring `isprint()` gating in the original.
pub fn printable_or_dot(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn si_prefix_picks_kilo_for_bytes() {
        let mut v = 2048.0;
        let p = si_prefix(&mut v, CountType::Bytes);
        assert_eq!(p, 'K');
        assert!((v - 2.0).abs() < 1e-9);
    }

    #[test]
    fn si_prefix_picks_lowercase_kilo_for_lines() {
        let mut v = 5000.0;
        let p = si_prefix(&mut v, CountType::Lines);
        assert_eq!(p, 'k');
        assert!((v - 5.0).abs() < 1e-9);
    }

    #[test]
    fn si_prefix_near_zero_has_no_prefix() {
        let mut v = 0.0000000001;
        let p = si_prefix(&mut v, CountType::Bytes);
        assert_eq!(p, ' ');
    }

    #[test]
    fn printable_or_dot_masks_control_bytes() {
        let s = printable_or_dot(&[b'a', 0x01, b'b', b'\n']);
        assert_eq!(s, "a.b.");
    }

    #[test]
    fn fit_width_pads_short_strings() {
        assert_eq!(fit_width("ab", 5), "ab   ");
        assert_eq!(fit_width("abcdef", 3), "abc");
    }
}

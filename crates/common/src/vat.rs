//! Norwegian VAT rates and amount handling.
//!
//! Amounts are integer øre end to end; floats never touch money. Parsing
//! accepts the formats Norwegian users actually type ("1 234,50", "500,-",
//! "kr 500") and formatting writes them back the same way.

use serde::{Deserialize, Serialize};

/// The Norwegian VAT rate bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VatRate {
    /// 25% - the general rate
    Standard,
    /// 15% - foodstuffs
    Food,
    /// 12% - passenger transport, cinema, lodging
    Low,
    /// 0% - exempt supplies
    Exempt,
}

impl VatRate {
    pub fn percent(&self) -> u32 {
        match self {
            VatRate::Standard => 25,
            VatRate::Food => 15,
            VatRate::Low => 12,
            VatRate::Exempt => 0,
        }
    }

    pub fn from_percent(percent: u32) -> Option<VatRate> {
        match percent {
            25 => Some(VatRate::Standard),
            15 => Some(VatRate::Food),
            12 => Some(VatRate::Low),
            0 => Some(VatRate::Exempt),
            _ => None,
        }
    }

    /// Guess the band from an expense description. Falls back to the
    /// general rate, which is also the safe default for deductions.
    pub fn infer(description: &str) -> VatRate {
        let text = description.to_lowercase();
        const LOW: [&str; 8] = [
            "taxi", "drosje", "tog", "buss", "fly", "kino", "hotell", "overnatting",
        ];
        const FOOD: [&str; 5] = ["mat", "lunsj", "middag", "frokost", "dagligvare"];
        if LOW.iter().any(|k| text.contains(k)) {
            VatRate::Low
        } else if FOOD.iter().any(|k| text.contains(k)) {
            VatRate::Food
        } else {
            VatRate::Standard
        }
    }
}

/// Whether a stated amount includes VAT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VatTreatment {
    Inclusive,
    Exclusive,
}

/// Detect an explicit VAT treatment in free text. `None` means the user did
/// not say, and the caller has to ask.
pub fn detect_treatment(text: &str) -> Option<VatTreatment> {
    let text = text.to_lowercase();
    const INCLUSIVE: [&str; 4] = ["inkl. mva", "inkl mva", "inklusiv mva", "med mva"];
    const EXCLUSIVE: [&str; 5] = [
        "eks. mva",
        "eks mva",
        "ekskl. mva",
        "ekskl mva",
        "uten mva",
    ];
    if INCLUSIVE.iter().any(|k| text.contains(k)) {
        Some(VatTreatment::Inclusive)
    } else if EXCLUSIVE.iter().any(|k| text.contains(k)) {
        Some(VatTreatment::Exclusive)
    } else {
        None
    }
}

/// Parse a Norwegian-style amount into øre.
///
/// Comma is the decimal separator; spaces and dots group thousands. A
/// trailing ",-" means whole kroner. Currency markers ("kr", "NOK") are
/// ignored wherever they appear.
pub fn parse_amount_ore(input: &str) -> Option<i64> {
    let lowered = input.to_lowercase().replace(",-", " ");
    let token: String = lowered
        .chars()
        .map(|c| if c == '\u{a0}' { ' ' } else { c })
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | ' ' | '-'))
        .collect();
    let token = token.trim().trim_matches('.');
    if token.is_empty() {
        return None;
    }

    let negative = token.starts_with('-');
    let token = token.trim_start_matches('-');

    let (integer_part, frac_part) = match token.rsplit_once(',') {
        Some((head, tail)) => (head.to_string(), tail.trim().to_string()),
        None => match token.rsplit_once('.') {
            // A three-digit tail after a dot is a thousands group, not øre.
            Some((_, tail)) if tail.len() == 3 => (token.to_string(), String::new()),
            Some((head, tail)) => (head.to_string(), tail.trim().to_string()),
            None => (token.to_string(), String::new()),
        },
    };

    let digits: String = integer_part
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() && frac_part.is_empty() {
        return None;
    }

    let kroner: i64 = if digits.is_empty() {
        0
    } else {
        digits.parse().ok()?
    };
    let ore: i64 = match frac_part.len() {
        0 => 0,
        1 => frac_part.parse::<i64>().ok()? * 10,
        2 => frac_part.parse().ok()?,
        _ => return None,
    };

    let total = kroner.checked_mul(100)?.checked_add(ore)?;
    Some(if negative { -total } else { total })
}

/// Net amount from a VAT-inclusive gross, rounded half-up on øre.
pub fn net_from_gross(gross_ore: i64, rate: VatRate) -> i64 {
    let divisor = 100 + rate.percent() as i128;
    let scaled = gross_ore as i128 * 100;
    let rounded = if scaled >= 0 {
        (scaled + divisor / 2) / divisor
    } else {
        (scaled - divisor / 2) / divisor
    };
    rounded as i64
}

/// VAT portion of a VAT-inclusive gross.
pub fn vat_from_gross(gross_ore: i64, rate: VatRate) -> i64 {
    gross_ore - net_from_gross(gross_ore, rate)
}

/// Gross amount from a net, rounded half-up on øre.
pub fn gross_from_net(net_ore: i64, rate: VatRate) -> i64 {
    let factor = 100 + rate.percent() as i128;
    let scaled = net_ore as i128 * factor;
    let rounded = if scaled >= 0 {
        (scaled + 50) / 100
    } else {
        (scaled - 50) / 100
    };
    rounded as i64
}

/// Format øre as Norwegian kroner, e.g. `1 234,50 kr`.
pub fn format_nok(amount_ore: i64) -> String {
    let negative = amount_ore < 0;
    let amount = amount_ore.unsigned_abs();
    let kroner = amount / 100;
    let ore = amount % 100;

    let digits = kroner.to_string();
    let mut grouped = String::new();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(' ');
        }
        grouped.push(c);
    }

    format!(
        "{}{grouped},{ore:02} kr",
        if negative { "-" } else { "" }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_and_currency_markers() {
        assert_eq!(parse_amount_ore("500"), Some(50000));
        assert_eq!(parse_amount_ore("500 kr"), Some(50000));
        assert_eq!(parse_amount_ore("kr 500"), Some(50000));
        assert_eq!(parse_amount_ore("NOK 500"), Some(50000));
        assert_eq!(parse_amount_ore("500,-"), Some(50000));
    }

    #[test]
    fn test_parse_decimals_and_grouping() {
        assert_eq!(parse_amount_ore("1 234,50"), Some(123450));
        assert_eq!(parse_amount_ore("1.234,50"), Some(123450));
        assert_eq!(parse_amount_ore("234.50"), Some(23450));
        assert_eq!(parse_amount_ore("12,5"), Some(1250));
        assert_eq!(parse_amount_ore("1.234"), Some(123400));
        assert_eq!(parse_amount_ore("-250,00"), Some(-25000));
    }

    #[test]
    fn test_parse_rejects_junk() {
        assert_eq!(parse_amount_ore("snart"), None);
        assert_eq!(parse_amount_ore(""), None);
        assert_eq!(parse_amount_ore("12,345"), None);
    }

    #[test]
    fn test_treatment_detection() {
        assert_eq!(
            detect_treatment("500 kr inkl. mva"),
            Some(VatTreatment::Inclusive)
        );
        assert_eq!(
            detect_treatment("500 kr eks. mva"),
            Some(VatTreatment::Exclusive)
        );
        assert_eq!(detect_treatment("fakturer 500 kr"), None);
    }

    #[test]
    fn test_rate_bands() {
        assert_eq!(VatRate::Standard.percent(), 25);
        assert_eq!(VatRate::from_percent(12), Some(VatRate::Low));
        assert_eq!(VatRate::from_percent(7), None);
    }

    #[test]
    fn test_rate_inference() {
        assert_eq!(VatRate::infer("Taxi til flyplassen"), VatRate::Low);
        assert_eq!(VatRate::infer("Lunsj med kunde"), VatRate::Food);
        assert_eq!(VatRate::infer("Kontorrekvisita"), VatRate::Standard);
    }

    #[test]
    fn test_net_from_gross_standard_rate() {
        // 500 kr incl. 25% -> 400 kr net, 100 kr VAT
        assert_eq!(net_from_gross(50000, VatRate::Standard), 40000);
        assert_eq!(vat_from_gross(50000, VatRate::Standard), 10000);
    }

    #[test]
    fn test_net_from_gross_low_rate_rounds_half_up() {
        // 250 kr incl. 12% -> 223,21 kr net
        assert_eq!(net_from_gross(25000, VatRate::Low), 22321);
        assert_eq!(vat_from_gross(25000, VatRate::Low), 2679);
    }

    #[test]
    fn test_gross_from_net() {
        assert_eq!(gross_from_net(40000, VatRate::Standard), 50000);
        assert_eq!(gross_from_net(22321, VatRate::Low), 25000);
        assert_eq!(gross_from_net(10000, VatRate::Exempt), 10000);
    }

    #[test]
    fn test_format_nok() {
        assert_eq!(format_nok(123450), "1 234,50 kr");
        assert_eq!(format_nok(50000), "500,00 kr");
        assert_eq!(format_nok(-2679), "-26,79 kr");
        assert_eq!(format_nok(100000000), "1 000 000,00 kr");
    }
}

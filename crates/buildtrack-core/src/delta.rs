/// Period-over-period change between two percentage readings.
///
/// Non-numeric inputs (missing, NaN, infinite) yield 0. Both sides are floored before
/// subtracting and the sign is kept, so a regression reports a negative delta.
pub fn delta(now: Option<f64>, before: Option<f64>) -> i64 {
    match (numeric(now), numeric(before)) {
        (Some(now), Some(before)) => now.floor() as i64 - before.floor() as i64,
        _ => 0,
    }
}

/// Parses a loosely formatted percentage (`"45"`, `" 45.5 "`, `"45,5"`).
pub fn parse_percent(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    trimmed
        .replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

fn numeric(value: Option<f64>) -> Option<f64> {
    value.filter(|value| value.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_floors_both_sides() {
        assert_eq!(delta(Some(45.9), Some(30.2)), 15);
        assert_eq!(delta(Some(50.0), Some(50.0)), 0);
    }

    #[test]
    fn delta_keeps_regressions_negative() {
        assert_eq!(delta(Some(20.0), Some(35.0)), -15);
    }

    #[test]
    fn delta_is_zero_for_non_numeric_sides() {
        assert_eq!(delta(None, Some(10.0)), 0);
        assert_eq!(delta(Some(10.0), None), 0);
        assert_eq!(delta(Some(f64::NAN), Some(10.0)), 0);
        assert_eq!(delta(Some(f64::INFINITY), Some(10.0)), 0);
    }

    #[test]
    fn delta_is_antisymmetric() {
        let samples = [
            None,
            Some(0.0),
            Some(12.5),
            Some(33.0),
            Some(99.9),
            Some(100.0),
        ];
        for a in samples {
            for b in samples {
                assert_eq!(delta(a, b), -delta(b, a), "a={a:?} b={b:?}");
            }
        }
    }

    #[test]
    fn parse_percent_accepts_comma_decimal_and_rejects_text() {
        assert_eq!(parse_percent(" 45 "), Some(45.0));
        assert_eq!(parse_percent("45,5"), Some(45.5));
        assert_eq!(parse_percent("n/a"), None);
        assert_eq!(parse_percent(""), None);
        assert_eq!(parse_percent("inf"), None);
    }
}

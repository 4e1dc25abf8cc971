//! Identifier sequencing within a category range

use recruit_common::config::CategoryRange;

/// Next free number in `range` given the identifiers already issued.
///
/// Identifiers outside the range (other categories, malformed values) are
/// ignored. Returns `None` when the range is exhausted.
pub fn next_number<'a, I>(range: &CategoryRange, issued: I) -> Option<u32>
where
    I: IntoIterator<Item = &'a str>,
{
    let highest = issued
        .into_iter()
        .filter_map(|id| range.parse_id(id))
        .max();
    let candidate = match highest {
        Some(n) => n.checked_add(1)?,
        None => range.start,
    };
    range.contains(candidate).then_some(candidate)
}

/// Formatted next identifier, or `None` when the range is exhausted
pub fn next_identifier<'a, I>(range: &CategoryRange, issued: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    next_number(range, issued).map(|n| range.format_id(n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use recruit_common::config::IdFormat;

    fn hc() -> CategoryRange {
        CategoryRange::new("HC", 3000, 10199)
    }

    #[test]
    fn test_first_identifier_is_range_start() {
        assert_eq!(next_identifier(&hc(), []), Some("HC-3000".to_string()));
    }

    #[test]
    fn test_next_is_max_plus_one() {
        let issued = ["HC-3000", "HC-3007", "HC-3002"];
        assert_eq!(next_number(&hc(), issued), Some(3008));
    }

    #[test]
    fn test_other_categories_and_garbage_ignored() {
        let issued = ["MDD-10250", "10300", "pending", "", "HC-3001"];
        assert_eq!(next_number(&hc(), issued), Some(3002));
    }

    #[test]
    fn test_gaps_are_not_reused() {
        let issued = ["HC-3000", "HC-3005"];
        assert_eq!(next_number(&hc(), issued), Some(3006));
    }

    #[test]
    fn test_exhausted_range() {
        let range = CategoryRange::new("HC", 3000, 3001);
        assert_eq!(next_number(&range, ["HC-3000", "HC-3001"]), None);
    }

    #[test]
    fn test_numeric_format_reads_legacy_prefixed_ids() {
        let range = CategoryRange {
            format: IdFormat::Numeric,
            ..hc()
        };
        assert_eq!(next_identifier(&range, ["HC-3004", "3005"]), Some("3006".to_string()));
    }
}

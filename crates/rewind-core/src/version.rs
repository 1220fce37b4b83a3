use std::cmp::Ordering;

/// Compare two package version strings component-wise.
///
/// Components are separated by `.` or `-` and compared numerically when both sides parse as
/// integers, so `1.9 < 1.10`. Non-numeric components fall back to string order. A version that
/// is a strict prefix of the other sorts first (`1.2 < 1.2.1`).
#[must_use]
pub fn compare_versions(lhs: &str, rhs: &str) -> Ordering {
    let mut lhs_parts = components(lhs);
    let mut rhs_parts = components(rhs);

    loop {
        match (lhs_parts.next(), rhs_parts.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(left), Some(right)) => {
                let ordering = match (left.parse::<u64>(), right.parse::<u64>()) {
                    (Ok(left), Ok(right)) => left.cmp(&right),
                    _ => left.cmp(right),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
        }
    }
}

fn components(value: &str) -> impl Iterator<Item = &str> {
    value.trim().split(['.', '-']).filter(|part| !part.is_empty())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn numeric_components_compare_as_numbers() {
        assert_eq!(compare_versions("1.9", "1.10"), Ordering::Less);
        assert_eq!(compare_versions("1.10", "1.2"), Ordering::Greater);
        assert_eq!(compare_versions("0.4-12", "0.4-9"), Ordering::Greater);
    }

    #[test]
    fn dash_and_dot_separators_are_equivalent() {
        assert_eq!(compare_versions("1.2-3", "1.2.3"), Ordering::Equal);
    }

    #[test]
    fn shorter_prefix_sorts_first() {
        assert_eq!(compare_versions("1.2", "1.2.1"), Ordering::Less);
        assert_eq!(compare_versions("2", "1.99"), Ordering::Greater);
    }

    #[test]
    fn non_numeric_components_fall_back_to_string_order() {
        assert_eq!(compare_versions("1.0.rc1", "1.0.rc2"), Ordering::Less);
    }

    proptest! {
        #[test]
        fn comparison_is_antisymmetric(
            lhs in proptest::collection::vec(0_u32..200, 1..5),
            rhs in proptest::collection::vec(0_u32..200, 1..5),
        ) {
            let lhs = lhs.iter().map(ToString::to_string).collect::<Vec<_>>().join(".");
            let rhs = rhs.iter().map(ToString::to_string).collect::<Vec<_>>().join(".");
            prop_assert_eq!(compare_versions(&lhs, &rhs), compare_versions(&rhs, &lhs).reverse());
        }
    }
}

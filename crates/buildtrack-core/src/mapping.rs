use crate::normalize_name;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImplementationMapping {
    /// Lowercase fragment searched for in the control point's library name.
    pub pattern: &'static str,
    /// Name of the implementation-timeline milestone it feeds.
    pub canonical_name: &'static str,
}

/// Control-point name fragments and the implementation milestones they feed.
/// Evaluated top to bottom; the first fragment contained in the name wins.
pub const IMPLEMENTATION_MAPPINGS: &[ImplementationMapping] = &[
    ImplementationMapping {
        pattern: "engineering survey",
        canonical_name: "Engineering surveys",
    },
    ImplementationMapping {
        pattern: "design documentation",
        canonical_name: "Design documentation",
    },
    ImplementationMapping {
        pattern: "expertise",
        canonical_name: "State expertise",
    },
    ImplementationMapping {
        pattern: "construction permit",
        canonical_name: "Construction permit",
    },
    ImplementationMapping {
        pattern: "preparatory",
        canonical_name: "Preparatory works",
    },
    ImplementationMapping {
        pattern: "engineering network",
        canonical_name: "Utility networks",
    },
    ImplementationMapping {
        pattern: "installation",
        canonical_name: "Construction and installation works",
    },
    ImplementationMapping {
        pattern: "landscaping",
        canonical_name: "Landscaping",
    },
    ImplementationMapping {
        pattern: "commissioning",
        canonical_name: "Commissioning",
    },
];

pub fn resolve_implementation_name(
    control_point_name: &str,
) -> Option<&'static ImplementationMapping> {
    let name = normalize_name(control_point_name);
    IMPLEMENTATION_MAPPINGS
        .iter()
        .find(|mapping| name.contains(mapping.pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_is_case_insensitive_substring() {
        let mapping = resolve_implementation_name("  Obtaining the CONSTRUCTION Permit ")
            .expect("mapped");
        assert_eq!(mapping.canonical_name, "Construction permit");
    }

    #[test]
    fn earlier_entries_take_precedence() {
        let mapping =
            resolve_implementation_name("State expertise of design documentation").expect("mapped");
        assert_eq!(mapping.canonical_name, "Design documentation");
    }

    #[test]
    fn unmapped_names_resolve_to_none() {
        assert!(resolve_implementation_name("Fence painting").is_none());
    }

    #[test]
    fn patterns_are_already_normalized() {
        for mapping in IMPLEMENTATION_MAPPINGS {
            assert_eq!(normalize_name(mapping.pattern), mapping.pattern);
        }
    }
}

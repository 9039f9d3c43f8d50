//! Unique identifier generation

use uuid::Uuid;

/// Source of globally-unique task identifiers
pub trait IdGenerator: Send + Sync {
    /// Produce a fresh identifier; never returns the same value twice
    fn generate(&self) -> String;
}

/// Random v4 UUIDs
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn generate(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_uuid_generator_is_unique() {
        let ids = UuidGenerator;
        let generated: HashSet<String> = (0..1000).map(|_| ids.generate()).collect();
        assert_eq!(generated.len(), 1000);
    }

    #[test]
    fn test_uuid_format() {
        let id = UuidGenerator.generate();
        assert_eq!(id.len(), 36);
        assert!(Uuid::parse_str(&id).is_ok());
    }
}

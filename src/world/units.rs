//! Unit types, troop stacks and garrisons

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Unit type identifier as used in game data (e.g. `spearman`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitTypeId(pub String);

impl UnitTypeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UnitTypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UnitTypeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A number of troops of one type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStack {
    pub unit: UnitTypeId,
    pub count: u32,
}

impl UnitStack {
    pub fn new(unit: impl Into<String>, count: u32) -> Self {
        Self {
            unit: UnitTypeId::new(unit),
            count,
        }
    }
}

/// Troops physically present in a village, by type
pub type Garrison = BTreeMap<UnitTypeId, u32>;

/// Validate an ordered stack list for a movement.
///
/// Duplicate types are merged into the first occurrence. Rejects an empty list
/// and zero counts.
pub fn normalize_stacks(stacks: &[UnitStack]) -> EngineResult<Vec<UnitStack>> {
    if stacks.is_empty() {
        return Err(EngineError::InvalidInput("stacks must not be empty".into()));
    }

    let mut merged: Vec<UnitStack> = Vec::with_capacity(stacks.len());
    for stack in stacks {
        if stack.count == 0 {
            return Err(EngineError::InvalidInput(format!(
                "stack of {} has zero count",
                stack.unit
            )));
        }
        match merged.iter_mut().find(|s| s.unit == stack.unit) {
            Some(existing) => {
                existing.count = existing.count.checked_add(stack.count).ok_or_else(|| {
                    EngineError::InvalidInput(format!("stack of {} overflows", stack.unit))
                })?;
            }
            None => merged.push(stack.clone()),
        }
    }
    Ok(merged)
}

/// What a movement is sent to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mission {
    Attack,
    Support,
    Settle,
    Scout,
    /// Troops travelling home; never issued by a player directly
    Return,
}

impl Mission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mission::Attack => "attack",
            Mission::Support => "support",
            Mission::Settle => "settle",
            Mission::Scout => "scout",
            Mission::Return => "return",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_merges_duplicates_in_order() {
        let stacks = vec![
            UnitStack::new("spearman", 10),
            UnitStack::new("scout", 5),
            UnitStack::new("spearman", 2),
        ];
        let merged = normalize_stacks(&stacks).unwrap();
        assert_eq!(
            merged,
            vec![UnitStack::new("spearman", 12), UnitStack::new("scout", 5)]
        );
    }

    #[test]
    fn normalize_rejects_empty_and_zero() {
        assert!(matches!(
            normalize_stacks(&[]),
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            normalize_stacks(&[UnitStack::new("axeman", 0)]),
            Err(EngineError::InvalidInput(_))
        ));
    }
}

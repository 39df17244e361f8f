use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::security::address_from_public_key;
use crate::types::primitives::Address;

/// Priorities are rescaled once their spread exceeds this multiple of the
/// total voting power.
const PRIORITY_WINDOW_SIZE_FACTOR: i128 = 2;

/// Keeps priority arithmetic in `i64` far from overflow.
pub const MAX_TOTAL_VOTING_POWER: u64 = (i64::MAX / 8) as u64;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidatorSetError {
    #[error("Validator set is empty")]
    Empty,
    #[error("Duplicate validator: {0}")]
    DuplicateValidator(Address),
    #[error("Invalid voting power for {0}")]
    InvalidVotingPower(Address),
    #[error("Total voting power {0} exceeds {}", MAX_TOTAL_VOTING_POWER)]
    TotalVotingPowerTooLarge(u128),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub address: Address,
    pub public_key: VerifyingKey,
    pub alternate_public_key: Option<VerifyingKey>,
    pub voting_power: u64,
    pub proposer_priority: i64,
}

impl Validator {
    pub fn new(
        public_key: VerifyingKey,
        alternate_public_key: Option<VerifyingKey>,
        voting_power: u64,
    ) -> Self {
        Self {
            address: address_from_public_key(&public_key),
            public_key,
            alternate_public_key,
            voting_power,
            proposer_priority: 0,
        }
    }

    /// Higher priority wins, ties go to the smaller address.
    fn wins_over(&self, other: &Validator) -> bool {
        match self.proposer_priority.cmp(&other.proposer_priority) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.address < other.address,
        }
    }
}

/// Validators of one height in their canonical (index) order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveValidatorSet {
    validators: Vec<Validator>,
    index: HashMap<Address, usize>,
    total_voting_power: u64,
    proposer: usize,
}

impl ActiveValidatorSet {
    pub fn new(validators: Vec<Validator>) -> Result<Self, ValidatorSetError> {
        if validators.is_empty() {
            return Err(ValidatorSetError::Empty);
        }

        let mut index = HashMap::with_capacity(validators.len());
        let mut total_voting_power: u128 = 0;
        for (i, validator) in validators.iter().enumerate() {
            if validator.voting_power == 0 {
                return Err(ValidatorSetError::InvalidVotingPower(validator.address));
            }
            if index.insert(validator.address, i).is_some() {
                return Err(ValidatorSetError::DuplicateValidator(validator.address));
            }
            total_voting_power += u128::from(validator.voting_power);
        }
        if total_voting_power > u128::from(MAX_TOTAL_VOTING_POWER) {
            return Err(ValidatorSetError::TotalVotingPowerTooLarge(total_voting_power));
        }
        let total_voting_power = total_voting_power as u64;

        let mut set = Self {
            validators,
            index,
            total_voting_power,
            proposer: 0,
        };
        set.proposer = set.find_proposer();
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    pub fn total_voting_power(&self) -> u64 {
        self.total_voting_power
    }

    pub fn proposer(&self) -> &Validator {
        &self.validators[self.proposer]
    }

    pub fn get_index_by_address(&self, address: &Address) -> Option<usize> {
        self.index.get(address).copied()
    }

    pub fn get_validator_by_index(&self, index: usize) -> Option<&Validator> {
        self.validators.get(index)
    }

    pub fn get_voting_power(&self, address: &Address) -> u64 {
        self.get_index_by_address(address)
            .map(|i| self.validators[i].voting_power)
            .unwrap_or(0)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.index.contains_key(address)
    }

    /// Advances the weighted round robin `times` steps on a copy.
    pub fn copy_increment_proposer_priority(&self, times: u32) -> Self {
        let mut copy = self.clone();
        copy.increment_proposer_priority(times);
        copy
    }

    pub fn increment_proposer_priority(&mut self, times: u32) {
        if times == 0 {
            return;
        }

        let diff_max = PRIORITY_WINDOW_SIZE_FACTOR * self.total_voting_power as i128;
        self.rescale_priorities(diff_max);
        self.shift_by_average_priority();

        for _ in 0..times {
            self.proposer = self.increment_once();
        }
    }

    fn increment_once(&mut self) -> usize {
        for validator in self.validators.iter_mut() {
            validator.proposer_priority = validator
                .proposer_priority
                .saturating_add(validator.voting_power as i64);
        }

        let proposer = self.find_proposer();
        let total = self.total_voting_power as i64;
        let winner = &mut self.validators[proposer];
        winner.proposer_priority = winner.proposer_priority.saturating_sub(total);
        proposer
    }

    fn find_proposer(&self) -> usize {
        let mut best = 0;
        for (i, validator) in self.validators.iter().enumerate().skip(1) {
            if validator.wins_over(&self.validators[best]) {
                best = i;
            }
        }
        best
    }

    fn rescale_priorities(&mut self, diff_max: i128) {
        if diff_max <= 0 {
            return;
        }
        let max = self.validators.iter().map(|v| v.proposer_priority).max().unwrap_or(0) as i128;
        let min = self.validators.iter().map(|v| v.proposer_priority).min().unwrap_or(0) as i128;
        let diff = max - min;
        if diff > diff_max {
            // ceil(diff / diff_max)
            let ratio = (diff + diff_max - 1) / diff_max;
            for validator in self.validators.iter_mut() {
                validator.proposer_priority = (validator.proposer_priority as i128 / ratio) as i64;
            }
        }
    }

    fn shift_by_average_priority(&mut self) {
        let n = self.validators.len() as i128;
        let sum: i128 = self
            .validators
            .iter()
            .map(|v| v.proposer_priority as i128)
            .sum();
        let average = sum.div_euclid(n);
        for validator in self.validators.iter_mut() {
            validator.proposer_priority = (validator.proposer_priority as i128 - average) as i64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use std::collections::HashMap;

    fn validator(seed: u8, power: u64) -> Validator {
        let key = SigningKey::from_bytes(&[seed; 32]);
        Validator::new(key.verifying_key(), None, power)
    }

    fn set(powers: &[u64]) -> ActiveValidatorSet {
        let validators = powers
            .iter()
            .enumerate()
            .map(|(i, power)| validator(i as u8 + 1, *power))
            .collect();
        ActiveValidatorSet::new(validators).unwrap()
    }

    #[test]
    fn empty_set_is_rejected() {
        assert_eq!(ActiveValidatorSet::new(vec![]), Err(ValidatorSetError::Empty));
    }

    #[test]
    fn duplicate_validator_is_rejected() {
        let result = ActiveValidatorSet::new(vec![validator(1, 1), validator(1, 2)]);
        assert!(matches!(result, Err(ValidatorSetError::DuplicateValidator(_))));
    }

    #[test]
    fn oversized_total_power_is_rejected() {
        let result = ActiveValidatorSet::new(vec![validator(1, MAX_TOTAL_VOTING_POWER), validator(2, 1)]);
        assert!(matches!(result, Err(ValidatorSetError::TotalVotingPowerTooLarge(_))));

        let result = ActiveValidatorSet::new(vec![validator(1, u64::MAX), validator(2, u64::MAX)]);
        assert!(matches!(result, Err(ValidatorSetError::TotalVotingPowerTooLarge(_))));

        assert!(ActiveValidatorSet::new(vec![validator(1, MAX_TOTAL_VOTING_POWER)]).is_ok());
    }

    #[test]
    fn increment_is_deterministic() {
        let base = set(&[10, 20, 30, 40]);
        for n in [0u32, 1, 7, 25] {
            let a = base.copy_increment_proposer_priority(n);
            let b = base.copy_increment_proposer_priority(n);
            assert_eq!(a.proposer().address, b.proposer().address);
            assert_eq!(a, b);
        }
    }

    #[test]
    fn copy_leaves_original_untouched() {
        let base = set(&[1, 2, 3]);
        let before = base.clone();
        let _ = base.copy_increment_proposer_priority(5);
        assert_eq!(base, before);
    }

    #[test]
    fn zero_increment_is_noop() {
        let base = set(&[5, 1]);
        assert_eq!(base.copy_increment_proposer_priority(0), base);
    }

    #[test]
    fn equal_power_rotates_through_everyone() {
        let base = set(&[1, 1, 1, 1]);
        let mut current = base.clone();
        let mut seen = Vec::new();
        for _ in 0..4 {
            current.increment_proposer_priority(1);
            seen.push(current.proposer().address);
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn selection_frequency_follows_voting_power() {
        let mut current = set(&[1, 3]);
        let mut counts: HashMap<Address, u32> = HashMap::new();
        for _ in 0..400 {
            current.increment_proposer_priority(1);
            *counts.entry(current.proposer().address).or_default() += 1;
        }
        let heavy = current.validators()[1].address;
        let light = current.validators()[0].address;
        assert_eq!(counts[&heavy], 300);
        assert_eq!(counts[&light], 100);
    }

    #[test]
    fn ties_go_to_smaller_address() {
        let base = set(&[1, 1]);
        let smaller = base.validators().iter().map(|v| v.address).min().unwrap();
        let next = base.copy_increment_proposer_priority(1);
        assert_eq!(next.proposer().address, smaller);
    }

    #[test]
    fn lookups_by_address_and_index() {
        let base = set(&[4, 6]);
        let second = base.validators()[1].address;
        assert_eq!(base.get_index_by_address(&second), Some(1));
        assert_eq!(base.get_voting_power(&second), 6);
        assert_eq!(base.total_voting_power(), 10);
        assert!(base.get_validator_by_index(2).is_none());
    }
}

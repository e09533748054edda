//! Register tables and the grouping of registers into bulk reads.

use crate::inverter::snapshot::{Value, Values};
use crate::prelude::*;

/// Largest hole (in registers) bridged when merging addresses into one read.
pub const GROUP_GAP: u16 = 10;

/// Custom conversion of a raw signed word, used instead of `scale`.
pub type Transform = fn(i32) -> f64;

/// Where one quantity lives on a given model.
#[derive(Clone, Copy, Debug)]
pub struct RegisterSpec {
    /// `None` when the model does not expose this quantity.
    pub address: Option<u16>,
    pub scale: f64,
    pub transform: Option<Transform>,
}

impl RegisterSpec {
    /// Raw value, unscaled.
    pub const fn at(address: u16) -> Self {
        Self {
            address: Some(address),
            scale: 1.0,
            transform: None,
        }
    }

    /// Raw value times `scale`, rounded to three decimals.
    pub const fn scaled(address: u16, scale: f64) -> Self {
        Self {
            address: Some(address),
            scale,
            transform: None,
        }
    }

    pub const fn with(address: u16, transform: Transform) -> Self {
        Self {
            address: Some(address),
            scale: 1.0,
            transform: Some(transform),
        }
    }

    /// Quantity the model does not expose; never read.
    pub const fn unsupported() -> Self {
        Self {
            address: None,
            scale: 1.0,
            transform: None,
        }
    }

    /// Convert a raw signed word to the quantity's value.
    pub fn apply(&self, raw: i32) -> f64 {
        match self.transform {
            Some(transform) => transform(raw),
            None if self.scale == 1.0 => f64::from(raw),
            None => Utils::round(f64::from(raw) * self.scale, 3),
        }
    }
}

/// Contiguous span of registers fetched with a single read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterGroup {
    pub start: u16,
    pub count: u16,
}

impl RegisterGroup {
    pub fn new(start: u16, count: u16) -> Self {
        Self { start, count }
    }

    pub fn contains(&self, address: u16) -> bool {
        address >= self.start && u32::from(address) < u32::from(self.start) + u32::from(self.count)
    }
}

/// Merge addresses into the fewest spans, bridging holes of up to `gap`.
pub fn coalesce<I>(addresses: I, gap: u16) -> Vec<RegisterGroup>
where
    I: IntoIterator<Item = u16>,
{
    let mut addresses: Vec<u16> = addresses.into_iter().collect();
    addresses.sort_unstable();
    addresses.dedup();

    let mut groups = Vec::new();
    let mut iter = addresses.into_iter();
    let Some(first) = iter.next() else {
        return groups;
    };

    let (mut start, mut end) = (first, first);
    for address in iter {
        if u32::from(address) <= u32::from(end) + u32::from(gap) {
            end = address;
        } else {
            groups.push(RegisterGroup::new(start, end - start + 1));
            start = address;
            end = address;
        }
    }
    groups.push(RegisterGroup::new(start, end - start + 1));

    groups
}

/// Static quantity -> register table for one model.
#[derive(Clone, Debug, Default)]
pub struct RegisterMap {
    entries: Vec<(&'static str, RegisterSpec)>,
}

impl RegisterMap {
    pub fn new(entries: Vec<(&'static str, RegisterSpec)>) -> Self {
        Self { entries }
    }

    /// Look up a quantity by name.
    pub fn get(&self, name: &str) -> Option<&RegisterSpec> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, spec)| spec)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Read groups covering every supported quantity, in address order.
    pub fn groups(&self) -> Vec<RegisterGroup> {
        coalesce(
            self.entries.iter().filter_map(|(_, spec)| spec.address),
            GROUP_GAP,
        )
    }

    /// Attribute the words read for `group` to every quantity inside it.
    /// Quantities past the end of a short reply are left out.
    pub fn attribute(&self, group: &RegisterGroup, words: &[i32], values: &mut Values) {
        for (name, spec) in &self.entries {
            let Some(address) = spec.address else {
                continue;
            };
            if !group.contains(address) {
                continue;
            }
            if let Some(raw) = words.get((address - group.start) as usize) {
                values.insert(*name, Value::Number(spec.apply(*raw)));
            }
        }
    }
}

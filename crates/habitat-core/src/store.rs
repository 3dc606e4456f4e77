//! Stores: containers owning phases and a volume budget.

use crate::error::SetupError;
use crate::id::{ManipId, P2pId, PhaseId, StoreId};
use crate::phase::{Phase, PhaseKind};
use serde::{Deserialize, Serialize};
use slotmap::SlotMap;

/// Volume budget of a store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Capacity {
    /// Fixed total volume in m³. Phase creation fails once it is used up.
    Fixed(f64),
    /// Unbounded; phases occupy whatever volume they need.
    Dynamic,
}

/// A container of phases.
#[derive(Debug, Clone)]
pub struct Store {
    pub(crate) id: StoreId,
    name: String,
    capacity: Capacity,
    /// Volume reserved by phases at creation time.
    committed: f64,
    standard_volume: bool,
    pub(crate) phases: Vec<PhaseId>,
    pub(crate) p2ps: Vec<P2pId>,
    pub(crate) manipulators: Vec<ManipId>,
}

impl Store {
    pub(crate) fn new(id: StoreId, name: &str, capacity: Capacity) -> Self {
        Self {
            id,
            name: name.to_string(),
            capacity,
            committed: 0.0,
            standard_volume: false,
            phases: Vec::new(),
            p2ps: Vec::new(),
            manipulators: Vec::new(),
        }
    }

    pub fn id(&self) -> StoreId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    pub fn phases(&self) -> &[PhaseId] {
        &self.phases
    }

    pub fn p2ps(&self) -> &[P2pId] {
        &self.p2ps
    }

    pub fn manipulators(&self) -> &[ManipId] {
        &self.manipulators
    }

    /// Volume still available for new phases. Infinite for dynamic stores.
    pub fn remaining_volume(&self) -> f64 {
        match self.capacity {
            Capacity::Fixed(total) => (total - self.committed).max(0.0),
            Capacity::Dynamic => f64::INFINITY,
        }
    }

    /// Whether standard volume manipulators are enabled.
    pub fn has_standard_volume(&self) -> bool {
        self.standard_volume
    }

    pub(crate) fn enable_standard_volume(&mut self) {
        self.standard_volume = true;
    }

    /// Reserve `volume` m³ for a new phase.
    pub(crate) fn reserve(&mut self, volume: f64) -> Result<(), SetupError> {
        let remaining = self.remaining_volume();
        // Allow rounding noise when a store is filled exactly.
        if volume > remaining * (1.0 + 1e-12) {
            return Err(SetupError::CapacityExceeded {
                store: self.name.clone(),
                requested: volume,
                remaining,
            });
        }
        self.committed += volume;
        Ok(())
    }

    /// Volume by which the phases of a fixed store exceed its capacity, if
    /// they do. Gas phases count with their current volume, condensed phases
    /// with the volume their masses occupy.
    pub(crate) fn overrun(&self, phases: &SlotMap<PhaseId, Phase>) -> Option<f64> {
        let Capacity::Fixed(total) = self.capacity else {
            return None;
        };
        let occupied: f64 = self
            .phases
            .iter()
            .filter_map(|id| phases.get(*id))
            .map(Phase::volume)
            .sum();
        let excess = occupied - total;
        (excess > total * 1e-9).then_some(excess)
    }

    /// Re-split the store volume after integration: gas phases share what
    /// condensed phases leave free, and condensed phases take the resulting
    /// gas pressure. Returns the volume by which condensed phases overrun a
    /// fixed capacity, if they do.
    pub(crate) fn apply_standard_volume(&self, phases: &mut SlotMap<PhaseId, Phase>) -> Option<f64> {
        if !self.standard_volume {
            return None;
        }
        let Capacity::Fixed(total) = self.capacity else {
            return None;
        };

        let mut condensed = 0.0;
        let mut gas_volume = 0.0;
        for id in &self.phases {
            if let Some(phase) = phases.get(*id) {
                if phase.kind() == PhaseKind::Gas {
                    gas_volume += phase.volume();
                } else {
                    condensed += phase.volume();
                }
            }
        }

        let free = total - condensed;
        if free <= 0.0 {
            return Some(-free);
        }

        // Gas phases keep their relative share of the free volume.
        let gas_ids: Vec<PhaseId> = self
            .phases
            .iter()
            .copied()
            .filter(|id| phases.get(*id).is_some_and(|p| p.kind() == PhaseKind::Gas))
            .collect();
        if gas_ids.is_empty() {
            return None;
        }
        let mut pressure = 0.0;
        for id in &gas_ids {
            if let Some(phase) = phases.get_mut(*id) {
                let share = if gas_volume > 0.0 {
                    phase.volume() / gas_volume
                } else {
                    1.0 / gas_ids.len() as f64
                };
                phase.set_volume(free * share);
                pressure = phase.pressure();
            }
        }
        for id in &self.phases {
            if let Some(phase) = phases.get_mut(*id)
                && phase.kind().is_condensed()
            {
                phase.set_pressure(pressure);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::{PhaseSpec, TimeStepProperties};
    use crate::registry::{Registry, RegistryBuilder};
    use std::sync::Arc;

    fn registry() -> Arc<Registry> {
        let mut b = RegistryBuilder::new();
        b.register("N2", 0.028, 808.0, 1040.0).unwrap();
        b.register("H2O", 0.018, 1000.0, 4186.0).unwrap();
        Arc::new(b.build().unwrap())
    }

    fn add_phase(
        store: &mut Store,
        phases: &mut SlotMap<PhaseId, Phase>,
        spec: PhaseSpec,
    ) -> PhaseId {
        let reg = registry();
        let store_id = store.id;
        let id = phases.insert_with_key(|id| {
            Phase::new(id, store_id, spec, reg, &TimeStepProperties::default(), 1e-10)
        });
        store.phases.push(id);
        id
    }

    fn store(capacity: Capacity) -> Store {
        let mut ids = SlotMap::<StoreId, ()>::with_key();
        Store::new(ids.insert(()), "Tank", capacity)
    }

    #[test]
    fn reserve_within_budget() {
        let mut s = store(Capacity::Fixed(1.0));
        s.reserve(0.4).unwrap();
        s.reserve(0.6).unwrap();
        assert_eq!(s.remaining_volume(), 0.0);
    }

    #[test]
    fn reserve_over_budget_fails() {
        let mut s = store(Capacity::Fixed(1.0));
        s.reserve(0.75).unwrap();
        let err = s.reserve(0.5).unwrap_err();
        assert_eq!(
            err,
            SetupError::CapacityExceeded {
                store: "Tank".into(),
                requested: 0.5,
                remaining: 0.25,
            }
        );
        // A failed reservation leaves the budget untouched.
        assert_eq!(s.remaining_volume(), 0.25);
    }

    #[test]
    fn dynamic_store_is_unbounded() {
        let mut s = store(Capacity::Dynamic);
        s.reserve(1e9).unwrap();
        assert_eq!(s.remaining_volume(), f64::INFINITY);
    }

    #[test]
    fn overrun_counts_gas_and_condensed_volume() {
        let mut s = store(Capacity::Fixed(1.0));
        let mut phases = SlotMap::with_key();
        add_phase(&mut s, &mut phases, PhaseSpec::gas("Air", 0.5, vec![1.0, 0.0], 300.0));
        add_phase(
            &mut s,
            &mut phases,
            PhaseSpec::liquid("Water", vec![0.0, 400.0], 300.0, 1e5),
        );
        assert_eq!(s.overrun(&phases), None);

        add_phase(
            &mut s,
            &mut phases,
            PhaseSpec::liquid("Ice", vec![0.0, 200.0], 300.0, 1e5),
        );
        let excess = s.overrun(&phases).unwrap();
        assert!((excess - 0.1).abs() < 1e-12);
        assert_eq!(store(Capacity::Dynamic).overrun(&phases), None);
    }

    #[test]
    fn standard_volume_gives_gas_the_leftover() {
        let mut s = store(Capacity::Fixed(1.0));
        s.enable_standard_volume();
        let mut phases = SlotMap::with_key();
        let gas = add_phase(&mut s, &mut phases, PhaseSpec::gas("Air", 0.9, vec![1.0, 0.0], 300.0));
        let water = add_phase(
            &mut s,
            &mut phases,
            PhaseSpec::liquid("Water", vec![0.0, 200.0], 300.0, 1e5),
        );
        assert_eq!(s.apply_standard_volume(&mut phases), None);
        assert!((phases[gas].volume() - 0.8).abs() < 1e-12);
        assert_eq!(phases[water].pressure(), phases[gas].pressure());
    }

    #[test]
    fn standard_volume_reports_overrun() {
        let mut s = store(Capacity::Fixed(0.1));
        s.enable_standard_volume();
        let mut phases = SlotMap::with_key();
        add_phase(
            &mut s,
            &mut phases,
            PhaseSpec::liquid("Water", vec![0.0, 150.0], 300.0, 1e5),
        );
        let overrun = s.apply_standard_volume(&mut phases).unwrap();
        assert!((overrun - 0.05).abs() < 1e-12);
    }

    #[test]
    fn disabled_standard_volume_is_noop() {
        let s = store(Capacity::Fixed(0.1));
        let mut phases = SlotMap::with_key();
        assert_eq!(s.apply_standard_volume(&mut phases), None);
    }
}

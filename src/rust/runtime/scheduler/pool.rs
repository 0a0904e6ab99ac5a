// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Arena of reusable fiber slots.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::scheduler::task::{
    FiberSlot,
    TaskId,
    TaskRemains,
    TaskState,
};

//======================================================================================================================
// Structures
//======================================================================================================================

pub struct FiberPool {
    slots: Vec<FiberSlot>,
    /// Indexes of vacant slots. The most recently released slot is reused first.
    free: Vec<u32>,
    live: usize,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl FiberPool {
    /// Creates a pool with `capacity` vacant slots.
    pub fn new(capacity: usize) -> Self {
        let mut slots: Vec<FiberSlot> = Vec::with_capacity(capacity);
        slots.resize_with(capacity, FiberSlot::default);
        Self {
            slots,
            free: (0..capacity as u32).rev().collect(),
            live: 0,
        }
    }

    /// Claims a vacant slot, growing the pool if needed. The returned id carries a fresh generation.
    pub fn allocate(&mut self) -> TaskId {
        let slot: u32 = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(FiberSlot::default());
                (self.slots.len() - 1) as u32
            },
        };
        let entry: &mut FiberSlot = &mut self.slots[slot as usize];
        entry.generation = entry.generation.wrapping_add(1);
        entry.state = TaskState::Unstarted;
        self.live += 1;
        TaskId {
            slot,
            generation: entry.generation,
        }
    }

    /// Returns the slot of a live task, or `None` if the id is stale.
    pub fn get(&self, id: TaskId) -> Option<&FiberSlot> {
        self.slots
            .get(id.slot as usize)
            .filter(|entry| entry.generation == id.generation && entry.is_live())
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut FiberSlot> {
        self.slots
            .get_mut(id.slot as usize)
            .filter(|entry| entry.generation == id.generation && entry.is_live())
    }

    /// State of a task. Stale ids report [TaskState::Terminated].
    pub fn state(&self, id: TaskId) -> TaskState {
        self.get(id).map_or(TaskState::Terminated, |entry| entry.state)
    }

    /// Vacates the slot of a finished task.
    pub fn release(&mut self, id: TaskId) -> Option<TaskRemains> {
        let remains: TaskRemains = self.get_mut(id)?.clear();
        self.free.push(id.slot);
        self.live -= 1;
        Some(remains)
    }

    /// Number of slots hosting a task.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Number of slots, vacant or not.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Ids of every live task.
    pub fn live_ids(&self) -> Vec<TaskId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_live())
            .map(|(slot, entry)| TaskId {
                slot: slot as u32,
                generation: entry.generation,
            })
            .collect()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

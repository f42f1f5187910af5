use tracing::warn;

use crate::error::StoreError;
use crate::storage::{DurableStore, StateKey};

pub const UPDATE_FLAG_NORMAL: i32 = 100;
pub const UPDATE_FLAG_PENDING: i32 = 102;

/// Persisted firmware-update intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateFlag {
    Normal,
    UpdateRequested,
}

impl UpdateFlag {
    pub fn code(self) -> i32 {
        match self {
            UpdateFlag::Normal => UPDATE_FLAG_NORMAL,
            UpdateFlag::UpdateRequested => UPDATE_FLAG_PENDING,
        }
    }

    /// Only the pending code means pending; anything else, including garbage, is normal.
    pub fn from_code(code: i32) -> Self {
        if code == UPDATE_FLAG_PENDING {
            UpdateFlag::UpdateRequested
        } else {
            UpdateFlag::Normal
        }
    }
}

/// Typed view over the durable region: the rest tick and the update flag.
#[derive(Debug)]
pub struct PersistedState<S> {
    store: S,
}

impl<S: DurableStore> PersistedState<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Hardware cycles consumed by the rest in progress, `None` when no rest is in progress.
    pub fn rest_tick(&self) -> Option<u32> {
        match self.store.get::<u32>(StateKey::RestTick) {
            Ok(Some(0)) | Ok(None) => None,
            Ok(Some(tick)) => Some(tick),
            Err(e) => {
                warn!(error = %e, "Unreadable rest tick, treating as unset");
                None
            }
        }
    }

    pub fn set_rest_tick(&mut self, tick: u32) -> Result<(), StoreError> {
        self.store.put(StateKey::RestTick, &tick)
    }

    pub fn clear_rest_tick(&mut self) -> Result<(), StoreError> {
        self.store.remove(StateKey::RestTick)
    }

    pub fn update_flag(&self) -> UpdateFlag {
        match self.store.get::<i32>(StateKey::UpdateFlag) {
            Ok(Some(code)) => UpdateFlag::from_code(code),
            Ok(None) => UpdateFlag::Normal,
            Err(e) => {
                warn!(error = %e, "Unreadable update flag, treating as normal");
                UpdateFlag::Normal
            }
        }
    }

    pub fn set_update_flag(&mut self, flag: UpdateFlag) -> Result<(), StoreError> {
        self.store.put(StateKey::UpdateFlag, &flag.code())
    }

    pub fn update_pending(&self) -> bool {
        self.update_flag() == UpdateFlag::UpdateRequested
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_inner(self) -> S {
        self.store
    }
}

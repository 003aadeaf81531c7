use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::game::common::IGame;
use crate::net::model::{InferenceInputs, InferenceModel, InferenceOutputs};

/// Registry of model replicas. `get` hands out one replica per inference
/// call, round-robin. Each replica sits behind its own mutex, so a model
/// that needs exclusive use is serialized internally and independent
/// replicas still run in parallel.
pub struct DeviceManager<Game: IGame> {
    devices: Vec<Mutex<Box<dyn InferenceModel<Game>>>>,
    next_device: AtomicUsize,
}

impl<Game: IGame> DeviceManager<Game> {
    pub fn new() -> Self {
        Self {
            devices: vec![],
            next_device: AtomicUsize::new(0),
        }
    }

    pub fn add_device(&mut self, model: Box<dyn InferenceModel<Game>>) {
        self.devices.push(Mutex::new(model));
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    /// Acquire a replica for one inference call. `hint_batch_size` is the
    /// expected batch size; the round-robin policy does not use it, but a
    /// load-aware policy would.
    pub fn get(&self, hint_batch_size: usize) -> DeviceRef<'_, Game> {
        let _ = hint_batch_size;
        assert!(!self.devices.is_empty(), "no devices registered");
        let idx = self.next_device.fetch_add(1, Ordering::Relaxed) % self.devices.len();
        DeviceRef {
            model: self.devices[idx].lock().unwrap(),
        }
    }
}

impl<Game: IGame> Default for DeviceManager<Game> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct DeviceRef<'a, Game: IGame> {
    model: MutexGuard<'a, Box<dyn InferenceModel<Game>>>,
}

impl<Game: IGame> DeviceRef<'_, Game> {
    pub fn inference(&mut self, batch: &[InferenceInputs<Game>]) -> Vec<InferenceOutputs<Game>> {
        let outputs = self.model.inference(batch);
        assert_eq!(outputs.len(), batch.len());
        outputs
    }
}

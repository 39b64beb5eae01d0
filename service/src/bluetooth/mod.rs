//! Bluetooth layer of the CAP client.
//!
//! This module provides the GATT sub-client adapters on top of BlueZ, the
//! characteristic payload codec, LE Audio device recognition and the manager
//! actor that drives the orchestrator.

pub mod codec;
pub mod gatt;
pub mod manager;
pub mod recognition;
pub mod subclients;

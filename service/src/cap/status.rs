//! Result taxonomy of the orchestrator.

use serde::Serialize;
use thiserror::Error;

use crate::cap::{ase::AseState, types::Service};

/// Why a request, or one device's share of it, did not succeed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Failure {
   #[error("Invalid group")]
   InvalidGroup,

   #[error("Invalid device")]
   InvalidDevice,

   #[error("Task not registered")]
   TaskNotRegistered,

   #[error("Busy")]
   Busy,

   #[error("Not configured")]
   NotConfigured,

   #[error("Context unavailable")]
   ContextUnavailable,

   #[error("Not supported")]
   NotSupported,

   #[error("Discovery error")]
   DiscoveryError,

   #[error("Null instance")]
   NullInstance,

   #[error("Invalid operation")]
   InvalidOperation,

   #[error("Invalid parameter")]
   InvalidParameter,

   #[error("Capabilities not discovered")]
   CapabilitiesNotDiscovered,

   #[error("Stream already active")]
   StreamAlreadyActive,

   #[error("Broadcast assistant is in the wrong state")]
   InvalidAssistantState,

   #[error("Insufficient endpoints")]
   InsufficientEndpoints,

   #[error("Insufficient resources")]
   InsufficientResources,

   #[error("Coordinated set lock unavailable")]
   LockUnavailable,

   #[error("CIS handle {handle:#06x} already bound")]
   DuplicateCisHandle { handle: u16 },

   #[error("ASE {ase_id} cannot move from {from} to {to}")]
   InvalidAseTransition {
      ase_id: u8,
      from: AseState,
      to: AseState,
   },

   #[error("No device matched the request")]
   NoDevice,

   #[error("Device disconnected")]
   Disconnected,

   #[error("Cancelled")]
   Cancelled,

   #[error("Request timeout")]
   Timeout,

   #[error("{service} error {code:#04x}")]
   Protocol { service: Service, code: u8 },
}

/// Overall or per-device outcome of a request.
pub type OpResult = std::result::Result<(), Failure>;

/// Outcome of the most recent operation on one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecentStatus {
   #[default]
   Success,
   InProgress,
   Failed(Failure),
}

impl RecentStatus {
   /// Folds one sub-request outcome in; the first failure sticks.
   pub fn record(&mut self, outcome: OpResult) {
      match (*self, outcome) {
         (Self::Failed(_), _) => {},
         (_, Err(failure)) => *self = Self::Failed(failure),
         (_, Ok(())) => {},
      }
   }

   /// Status once every slot of a fan-out has resolved.
   pub fn settle(&mut self) {
      if *self == Self::InProgress {
         *self = Self::Success;
      }
   }

   pub const fn is_failed(self) -> bool {
      matches!(self, Self::Failed(_))
   }

   pub const fn as_result(self) -> OpResult {
      match self {
         Self::Success => Ok(()),
         Self::InProgress => Err(Failure::NullInstance),
         Self::Failed(failure) => Err(failure),
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_first_failure_sticks() {
      let mut status = RecentStatus::InProgress;
      status.record(Ok(()));
      assert_eq!(status, RecentStatus::InProgress);

      status.record(Err(Failure::Timeout));
      status.record(Err(Failure::Disconnected));
      status.record(Ok(()));
      status.settle();
      assert_eq!(status.as_result(), Err(Failure::Timeout));
   }

   #[test]
   fn test_settle() {
      let mut status = RecentStatus::InProgress;
      status.settle();
      assert_eq!(status, RecentStatus::Success);
      assert!(RecentStatus::InProgress.as_result().is_err());
   }

   #[test]
   fn test_protocol_display() {
      let failure = Failure::Protocol {
         service: Service::Csip,
         code: 0x80,
      };
      assert_eq!(failure.to_string(), "csip error 0x80");
   }
}

//! Builds the single application-facing confirmation of a request.

use serde::Serialize;
use smol_str::SmolStr;

use crate::cap::{
   arena::GroupId,
   group::GroupInstance,
   request::{OpKind, PendingOp},
   status::{Failure, OpResult},
   subclient::Lane,
   types::{AvailableContexts, Cid, MicState, ReceiveState, SetInfo, VolumeState},
};

/// Value a device contributed to a read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DeviceValue {
   Volume(VolumeState),
   Mic(MicState),
   ReceiveStates(Vec<ReceiveState>),
   SetInfo(SetInfo),
   Contexts(AvailableContexts),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceResult {
   pub cid: Cid,
   pub address: SmolStr,
   pub result: OpResult,
   #[serde(skip_serializing_if = "Option::is_none")]
   pub value: Option<DeviceValue>,
}

/// Exactly one per submitted request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Confirmation {
   pub op: OpKind,
   /// Set once the group exists; a failed init carries none.
   pub group: Option<GroupId>,
   pub result: OpResult,
   pub devices: Vec<DeviceResult>,
}

impl Confirmation {
   /// A confirmation carrying no per-device results.
   pub const fn bare(op: OpKind, group: Option<GroupId>, result: OpResult) -> Self {
      Self {
         op,
         group,
         result,
         devices: Vec::new(),
      }
   }

   pub const fn is_success(&self) -> bool {
      self.result.is_ok()
   }

   /// Whether at least one device succeeded.
   pub fn any_success(&self) -> bool {
      self.devices.iter().any(|d| d.result.is_ok())
   }
}

/// Folds the per-device statuses of `op` into its confirmation.
///
/// The overall result is the first failure in touch order, unless the
/// operation carries its own verdict. A device that left the group while the
/// operation ran counts as disconnected.
pub fn aggregate(group: &GroupInstance, lane: Lane, op: &PendingOp) -> Confirmation {
   let devices: Vec<DeviceResult> = op
      .touched
      .iter()
      .map(|cid| match group.device(*cid) {
         Some(device) => {
            let slot = device.slot(lane);
            DeviceResult {
               cid: *cid,
               address: device.address.clone(),
               result: slot.status.as_result(),
               value: slot.value.clone(),
            }
         },
         None => DeviceResult {
            cid: *cid,
            address: SmolStr::default(),
            result: Err(Failure::Disconnected),
            value: None,
         },
      })
      .collect();

   let first_failure = devices.iter().find_map(|d| d.result.err());
   let result = match (op.verdict, first_failure) {
      (Some(verdict), _) => Err(verdict),
      (None, Some(failure)) => Err(failure),
      (None, None) => Ok(()),
   };

   Confirmation {
      op: op.request.kind(),
      group: Some(group.id),
      result,
      devices,
   }
}

//! Per-group request queue and the in-flight slot of each lane.
//!
//! A lane is either idle or owns exactly one [`PendingOp`]. The transition
//! functions refuse to start a second operation on a busy lane, so the
//! single-outstanding-operation rule holds by construction.

use std::collections::VecDeque;

use crate::cap::request::{PendingOp, QueuedRequest};

#[derive(Debug, Default)]
pub enum LaneState {
   #[default]
   Idle,
   Busy(Box<PendingOp>),
}

impl LaneState {
   pub const fn is_idle(&self) -> bool {
      matches!(self, Self::Idle)
   }

   /// Takes ownership of `op`, handing it back when the lane is already busy.
   pub fn begin(&mut self, op: PendingOp) -> Result<(), PendingOp> {
      match self {
         Self::Busy(_) => Err(op),
         Self::Idle => {
            *self = Self::Busy(Box::new(op));
            Ok(())
         },
      }
   }

   pub fn finish(&mut self) -> Option<PendingOp> {
      match std::mem::take(self) {
         Self::Busy(op) => Some(*op),
         Self::Idle => None,
      }
   }

   pub fn pending(&self) -> Option<&PendingOp> {
      match self {
         Self::Busy(op) => Some(op),
         Self::Idle => None,
      }
   }

   pub fn pending_mut(&mut self) -> Option<&mut PendingOp> {
      match self {
         Self::Busy(op) => Some(op),
         Self::Idle => None,
      }
   }

   /// The pending operation, if it carries sequence number `seq`.
   pub fn current(&mut self, seq: u32) -> Option<&mut PendingOp> {
      self.pending_mut().filter(|op| op.seq == seq)
   }
}

/// FIFO of requests waiting for the general lane.
#[derive(Debug, Default)]
pub struct RequestQueue {
   entries: VecDeque<QueuedRequest>,
}

impl RequestQueue {
   pub fn push(&mut self, entry: QueuedRequest) {
      self.entries.push_back(entry);
   }

   pub fn pop(&mut self) -> Option<QueuedRequest> {
      self.entries.pop_front()
   }

   pub fn len(&self) -> usize {
      self.entries.len()
   }

   pub fn is_empty(&self) -> bool {
      self.entries.is_empty()
   }

   pub fn drain(&mut self) -> impl Iterator<Item = QueuedRequest> + '_ {
      self.entries.drain(..)
   }
}

/// The queued lane of a group.
#[derive(Debug, Default)]
pub struct GeneralLane {
   pub state: LaneState,
   pub queue: RequestQueue,
}

impl GeneralLane {
   /// Returns the entry back when it may start right away, otherwise queues it.
   pub fn admit(&mut self, entry: QueuedRequest) -> Option<QueuedRequest> {
      if self.state.is_idle() && self.queue.is_empty() {
         Some(entry)
      } else {
         self.queue.push(entry);
         None
      }
   }

   /// Next queued entry, once the lane is idle.
   pub fn next_ready(&mut self) -> Option<QueuedRequest> {
      if self.state.is_idle() { self.queue.pop() } else { None }
   }
}

#[cfg(test)]
mod tests {
   use tokio::sync::oneshot;

   use super::*;
   use crate::cap::request::{AppTask, Request};

   fn entry(request: Request) -> QueuedRequest {
      let (reply, _rx) = oneshot::channel();
      QueuedRequest {
         task: AppTask::new("test"),
         request,
         reply,
      }
   }

   #[test]
   fn test_busy_lane_refuses_second_op() {
      let mut lane = LaneState::Idle;
      assert!(lane.begin(PendingOp::new(1, entry(Request::Mute(true)))).is_ok());
      let rejected = lane.begin(PendingOp::new(2, entry(Request::SetVolume(4))));
      assert_eq!(rejected.unwrap_err().seq, 2);
      assert_eq!(lane.pending().map(|op| op.seq), Some(1));
      assert!(lane.current(2).is_none());
      assert_eq!(lane.finish().map(|op| op.seq), Some(1));
      assert!(lane.is_idle());
      assert!(lane.finish().is_none());
   }

   #[test]
   fn test_admit_keeps_fifo() {
      let mut lane = GeneralLane::default();
      let first = lane.admit(entry(Request::Mute(true))).unwrap();
      lane.state.begin(PendingOp::new(1, first)).unwrap();

      assert!(lane.admit(entry(Request::SetVolume(1))).is_none());
      assert!(lane.admit(entry(Request::SetVolume(2))).is_none());
      assert!(lane.next_ready().is_none());

      lane.state.finish();
      assert_eq!(lane.next_ready().unwrap().request, Request::SetVolume(1));
      // Still queued behind the idle lane until started
      assert!(lane.admit(entry(Request::Mute(false))).is_none());
      assert_eq!(lane.next_ready().unwrap().request, Request::SetVolume(2));
      assert_eq!(lane.next_ready().unwrap().request, Request::Mute(false));
      assert!(lane.queue.is_empty());
   }
}

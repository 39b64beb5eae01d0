//! Common Audio Profile client orchestration.
//!
//! One application request is carried out across every device of a group:
//! it is queued per group, fanned out to the per-service sub-clients of each
//! device, optionally behind the coordinated-set lock, and joined back into a
//! single [`aggregate::Confirmation`].

pub mod aggregate;
pub mod arena;
pub mod ase;
pub mod bass;
pub mod fanout;
pub mod group;
pub mod lock;
pub mod orchestrator;
pub mod phase;
pub mod queue;
pub mod request;
pub mod status;
pub mod subclient;
pub mod types;
pub mod unicast;

#[cfg(test)]
pub mod testing;

/// Represents the result of an update operation on orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp<T> {
   /// No change occurred
   Noop,
   /// A new value was inserted (None -> Some)
   Inserted,
   /// A value was deleted (Some -> None)
   Deleted(T),
   /// An existing value was replaced; carries the previous value
   Updated(T),
}

impl<T: PartialEq> UpdateOp<T> {
   /// Stores `new` in `dst`, reporting what changed.
   pub fn replace(dst: &mut Option<T>, new: Option<T>) -> Self {
      match (std::mem::replace(dst, new), dst.as_ref()) {
         (Some(p), Some(n)) if p == *n => Self::Noop,
         (None, Some(_)) => Self::Inserted,
         (Some(p), None) => Self::Deleted(p),
         (Some(p), Some(_)) => Self::Updated(p),
         (None, None) => Self::Noop,
      }
   }
}

impl<T> UpdateOp<T> {
   pub const fn is_changed(&self) -> bool {
      !matches!(self, Self::Noop)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_replace() {
      let mut slot = None;
      assert_eq!(UpdateOp::replace(&mut slot, Some(3)), UpdateOp::Inserted);
      assert_eq!(UpdateOp::replace(&mut slot, Some(3)), UpdateOp::Noop);
      assert_eq!(UpdateOp::replace(&mut slot, Some(4)), UpdateOp::Updated(3));
      assert_eq!(UpdateOp::replace(&mut slot, None), UpdateOp::Deleted(4));
      assert!(!UpdateOp::<u8>::Noop.is_changed());
   }
}

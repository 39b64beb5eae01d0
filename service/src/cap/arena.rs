//! Generation-checked slot arena holding live groups.
//!
//! A `GroupId` names a slot plus the generation it was issued for; once the
//! slot is recycled every stale id stops resolving.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Handle of a group instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u64", from = "u64")]
pub struct GroupId {
   index: u32,
   generation: u32,
}

impl GroupId {
   /// Packs the handle for transports that only carry integers.
   pub const fn to_raw(self) -> u64 {
      (self.generation as u64) << 32 | self.index as u64
   }

   pub const fn from_raw(raw: u64) -> Self {
      Self {
         index: raw as u32,
         generation: (raw >> 32) as u32,
      }
   }
}

impl From<GroupId> for u64 {
   fn from(id: GroupId) -> Self {
      id.to_raw()
   }
}

impl From<u64> for GroupId {
   fn from(raw: u64) -> Self {
      Self::from_raw(raw)
   }
}

impl fmt::Display for GroupId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "group#{}.{}", self.index, self.generation)
   }
}

enum Slot<T> {
   Occupied { generation: u32, value: T },
   Vacant { generation: u32 },
}

pub struct Arena<T> {
   slots: Vec<Slot<T>>,
   free: Vec<u32>,
   len: usize,
}

impl<T> Default for Arena<T> {
   fn default() -> Self {
      Self::new()
   }
}

impl<T> Arena<T> {
   pub const fn new() -> Self {
      Self {
         slots: Vec::new(),
         free: Vec::new(),
         len: 0,
      }
   }

   /// Inserts a value built from its own handle.
   pub fn insert_with(&mut self, build: impl FnOnce(GroupId) -> T) -> GroupId {
      let id = match self.free.pop() {
         Some(index) => {
            let generation = match self.slots[index as usize] {
               Slot::Vacant { generation } => generation,
               Slot::Occupied { generation, .. } => generation.wrapping_add(1),
            };
            GroupId { index, generation }
         },
         None => {
            self.slots.push(Slot::Vacant { generation: 0 });
            GroupId {
               index: (self.slots.len() - 1) as u32,
               generation: 0,
            }
         },
      };
      self.slots[id.index as usize] = Slot::Occupied {
         generation: id.generation,
         value: build(id),
      };
      self.len += 1;
      id
   }

   pub fn get(&self, id: GroupId) -> Option<&T> {
      match self.slots.get(id.index as usize)? {
         Slot::Occupied { generation, value } if *generation == id.generation => Some(value),
         _ => None,
      }
   }

   pub fn get_mut(&mut self, id: GroupId) -> Option<&mut T> {
      match self.slots.get_mut(id.index as usize)? {
         Slot::Occupied { generation, value } if *generation == id.generation => Some(value),
         _ => None,
      }
   }

   pub fn contains(&self, id: GroupId) -> bool {
      self.get(id).is_some()
   }

   /// Removes the value and retires its handle.
   pub fn remove(&mut self, id: GroupId) -> Option<T> {
      let slot = self.slots.get_mut(id.index as usize)?;
      match &*slot {
         Slot::Occupied { generation, .. } if *generation == id.generation => {},
         _ => return None,
      }
      let old = std::mem::replace(
         slot,
         Slot::Vacant {
            generation: id.generation.wrapping_add(1),
         },
      );
      self.free.push(id.index);
      self.len -= 1;
      match old {
         Slot::Occupied { value, .. } => Some(value),
         Slot::Vacant { .. } => None,
      }
   }

   pub const fn len(&self) -> usize {
      self.len
   }

   pub const fn is_empty(&self) -> bool {
      self.len == 0
   }

   pub fn iter(&self) -> impl Iterator<Item = (GroupId, &T)> {
      self.slots.iter().enumerate().filter_map(|(index, slot)| match slot {
         Slot::Occupied { generation, value } => Some((
            GroupId {
               index: index as u32,
               generation: *generation,
            },
            value,
         )),
         Slot::Vacant { .. } => None,
      })
   }

   pub fn ids(&self) -> Vec<GroupId> {
      self.iter().map(|(id, _)| id).collect()
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_insert_and_get() {
      let mut arena = Arena::new();
      let a = arena.insert_with(|_| "a");
      let b = arena.insert_with(|_| "b");
      assert_ne!(a, b);
      assert_eq!(arena.get(a), Some(&"a"));
      assert_eq!(arena.get(b), Some(&"b"));
      assert_eq!(arena.len(), 2);
   }

   #[test]
   fn test_stale_handle_rejected() {
      let mut arena = Arena::new();
      let old = arena.insert_with(|_| 1);
      assert_eq!(arena.remove(old), Some(1));
      assert!(arena.get(old).is_none());

      // Slot gets reused with a new generation
      let new = arena.insert_with(|_| 2);
      assert_eq!(new.index, old.index);
      assert_ne!(new, old);
      assert!(arena.get(old).is_none());
      assert_eq!(arena.remove(old), None);
      assert_eq!(arena.get(new), Some(&2));
   }

   #[test]
   fn test_build_sees_own_id() {
      let mut arena = Arena::new();
      let id = arena.insert_with(|id| id);
      assert_eq!(arena.get(id), Some(&id));
   }

   #[test]
   fn test_raw_round_trip() {
      let mut arena = Arena::new();
      let first = arena.insert_with(|_| ());
      arena.remove(first);
      let id = arena.insert_with(|_| ());
      assert_eq!(GroupId::from_raw(id.to_raw()), id);
      assert!(arena.contains(GroupId::from_raw(id.to_raw())));
      assert!(!arena.contains(GroupId::from_raw(first.to_raw())));
   }
}

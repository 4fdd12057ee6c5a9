//! Favorite slots (C5/C6): a fixed-size array of (parent, child) address
//! pairs. `(0,0)` in either half is the empty-slot sentinel, matching
//! [`shared::node::Address::EMPTY`].

use shared::node::Address;
use shared::protocol::Limits;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FavoriteSlot {
    pub parent: Address,
    pub child: Address,
}

impl FavoriteSlot {
    pub const EMPTY: FavoriteSlot = FavoriteSlot {
        parent: Address::EMPTY,
        child: Address::EMPTY,
    };

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty() && self.child.is_empty()
    }
}

/// Fixed-capacity favorite list; slots keep their index across edits so a
/// client's "favorite #3" reference stays stable — a stale favorite is
/// cleared in place, never compacted, when its child is deleted.
#[derive(Debug, Clone)]
pub struct Favorites {
    slots: Vec<FavoriteSlot>,
}

impl Favorites {
    pub fn new(limits: &Limits) -> Self {
        Self {
            slots: vec![FavoriteSlot::EMPTY; limits.max_favorites],
        }
    }

    pub fn slots(&self) -> &[FavoriteSlot] {
        &self.slots
    }

    pub fn set(&mut self, index: usize, slot: FavoriteSlot) {
        if let Some(s) = self.slots.get_mut(index) {
            *s = slot;
        }
    }

    pub fn clear(&mut self, index: usize) {
        self.set(index, FavoriteSlot::EMPTY);
    }

    /// Clears every favorite referencing `child`, leaving the slot's index
    /// untouched so later favorites don't shift.
    pub fn clear_references_to(&mut self, child: Address) {
        for slot in &mut self.slots {
            if slot.child == child {
                *slot = FavoriteSlot::EMPTY;
            }
        }
    }

    pub fn first_empty_index(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_favorite_is_cleared_in_place() {
        let limits = Limits::classic();
        let mut favs = Favorites::new(&limits);
        favs.set(2, FavoriteSlot { parent: Address::new(1, 1), child: Address::new(1, 2) });
        favs.set(5, FavoriteSlot { parent: Address::new(1, 1), child: Address::new(1, 2) });

        favs.clear_references_to(Address::new(1, 2));

        assert!(favs.slots()[2].is_empty());
        assert!(favs.slots()[5].is_empty());
        assert_eq!(favs.slots().len(), limits.max_favorites);
    }

    #[test]
    fn first_empty_index_finds_the_earliest_free_slot() {
        let limits = Limits::classic();
        let mut favs = Favorites::new(&limits);
        favs.set(0, FavoriteSlot { parent: Address::new(1, 1), child: Address::new(1, 2) });
        assert_eq!(favs.first_empty_index(), Some(1));
    }
}

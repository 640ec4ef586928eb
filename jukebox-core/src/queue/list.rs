//! Pure queue operations
//!
//! Every operation keeps `current_index` in range and, where items move,
//! pointing at the same item id it pointed at before.

use super::QueueError;
use crate::state::{QueueItem, QueueState};

impl QueueState {
    /// Check if an item with this id is queued
    pub fn contains(&self, id: &str) -> bool {
        self.items.iter().any(|item| item.id == id)
    }

    /// Position of the item with this id
    pub fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|item| item.id == id)
    }

    /// The item under the cursor
    pub fn current(&self) -> Option<&QueueItem> {
        self.current_index.and_then(|i| self.items.get(i))
    }

    /// Append an item. Rejected if its id is already queued.
    pub fn add(&mut self, item: QueueItem) -> Result<(), QueueError> {
        if self.contains(&item.id) {
            return Err(QueueError::DuplicateItem(item.id));
        }
        self.items.push(item);
        Ok(())
    }

    /// Remove an item by id.
    ///
    /// Removing an item before the cursor shifts the cursor down with it.
    /// Removing the current item leaves the cursor on the same slot, which
    /// now holds the next item, or clears it if that slot is gone.
    pub fn remove(&mut self, id: &str) -> Result<QueueItem, QueueError> {
        let position = self
            .position(id)
            .ok_or_else(|| QueueError::UnknownItem(id.to_string()))?;
        let removed = self.items.remove(position);

        self.current_index = match self.current_index {
            Some(current) if position < current => Some(current - 1),
            Some(current) if current >= self.items.len() => None,
            other => other,
        };
        Ok(removed)
    }

    /// Move an item to `new_position`; the cursor follows the id it was on
    pub fn reorder(&mut self, id: &str, new_position: usize) -> Result<(), QueueError> {
        let from = self
            .position(id)
            .ok_or_else(|| QueueError::UnknownItem(id.to_string()))?;
        if new_position >= self.items.len() {
            return Err(QueueError::InvalidPosition(new_position));
        }

        let current_id = self.current().map(|item| item.id.clone());
        let item = self.items.remove(from);
        self.items.insert(new_position, item);
        self.current_index = current_id.and_then(|id| self.position(&id));
        Ok(())
    }

    /// Step the cursor forward. From nothing selected it moves to the first
    /// item; past the last item it clears. Returns the new current item.
    pub fn advance(&mut self) -> Option<&QueueItem> {
        let next = self.current_index.map_or(0, |i| i + 1);
        self.current_index = (next < self.items.len()).then_some(next);
        self.current()
    }

    /// Point the cursor at `index`
    pub fn select(&mut self, index: usize) -> Result<&QueueItem, QueueError> {
        if index >= self.items.len() {
            return Err(QueueError::InvalidPosition(index));
        }
        self.current_index = Some(index);
        Ok(&self.items[index])
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.current_index = None;
    }

    /// Check the cursor invariant
    pub fn index_is_valid(&self) -> bool {
        self.current_index.map_or(true, |i| i < self.items.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn item(id: &str) -> QueueItem {
        QueueItem {
            id: id.to_string(),
            title: format!("Track {}", id),
            duration: 180.0,
            thumbnail: None,
            added_by: "dj".to_string(),
        }
    }

    fn queue(ids: &[&str], current: Option<usize>) -> QueueState {
        QueueState {
            items: ids.iter().map(|id| item(id)).collect(),
            current_index: current,
        }
    }

    fn ids(queue: &QueueState) -> Vec<&str> {
        queue.items.iter().map(|i| i.id.as_str()).collect()
    }

    #[test]
    fn test_add_rejects_duplicate() {
        let mut q = queue(&["A", "B"], None);
        assert_matches!(q.add(item("A")), Err(QueueError::DuplicateItem(id)) if id == "A");
        assert_eq!(ids(&q), vec!["A", "B"]);
    }

    #[test]
    fn test_remove_current_keeps_slot() {
        let mut q = queue(&["A", "B", "C"], Some(1));
        q.remove("B").unwrap();
        assert_eq!(ids(&q), vec!["A", "C"]);
        assert_eq!(q.current_index, Some(1));
        assert_eq!(q.current().unwrap().id, "C");
    }

    #[test]
    fn test_remove_current_last_clears() {
        let mut q = queue(&["A", "B"], Some(1));
        q.remove("B").unwrap();
        assert_eq!(q.current_index, None);
    }

    #[test]
    fn test_remove_before_current_shifts_cursor() {
        let mut q = queue(&["A", "B", "C"], Some(2));
        q.remove("A").unwrap();
        assert_eq!(q.current().unwrap().id, "C");
        assert_eq!(q.current_index, Some(1));
    }

    #[test]
    fn test_remove_after_current_leaves_cursor() {
        let mut q = queue(&["A", "B", "C"], Some(0));
        q.remove("C").unwrap();
        assert_eq!(q.current_index, Some(0));
    }

    #[test]
    fn test_remove_unknown() {
        let mut q = queue(&["A"], Some(0));
        assert_matches!(q.remove("Z"), Err(QueueError::UnknownItem(_)));
        assert_eq!(ids(&q), vec!["A"]);
    }

    #[test]
    fn test_reorder_follows_identity() {
        let mut q = queue(&["A", "B", "C"], Some(1));
        q.reorder("A", 2).unwrap();
        assert_eq!(ids(&q), vec!["B", "C", "A"]);
        assert_eq!(q.current_index, Some(0));
        assert_eq!(q.current().unwrap().id, "B");
    }

    #[test]
    fn test_reorder_current_item() {
        let mut q = queue(&["A", "B", "C"], Some(0));
        q.reorder("A", 1).unwrap();
        assert_eq!(ids(&q), vec!["B", "A", "C"]);
        assert_eq!(q.current_index, Some(1));
    }

    #[test]
    fn test_reorder_out_of_range() {
        let mut q = queue(&["A", "B"], None);
        assert_matches!(q.reorder("A", 2), Err(QueueError::InvalidPosition(2)));
    }

    #[test]
    fn test_advance_at_end_clears() {
        let mut q = queue(&["A", "B", "C"], Some(2));
        assert!(q.advance().is_none());
        assert_eq!(q.current_index, None);
    }

    #[test]
    fn test_advance_from_nothing_starts_at_first() {
        let mut q = queue(&["A", "B"], None);
        assert_eq!(q.advance().map(|i| i.id.clone()), Some("A".to_string()));
        assert_eq!(q.advance().map(|i| i.id.clone()), Some("B".to_string()));
    }

    #[test]
    fn test_advance_empty_queue() {
        let mut q = QueueState::default();
        assert!(q.advance().is_none());
        assert!(q.index_is_valid());
    }

    #[test]
    fn test_index_invariant_over_mixed_ops() {
        let mut q = queue(&["A", "B", "C", "D"], Some(3));
        q.remove("D").unwrap();
        assert!(q.index_is_valid());
        q.select(2).unwrap();
        q.reorder("C", 0).unwrap();
        assert!(q.index_is_valid());
        assert_eq!(q.current().unwrap().id, "C");
        q.remove("A").unwrap();
        q.remove("B").unwrap();
        q.remove("C").unwrap();
        assert!(q.index_is_valid());
        assert_eq!(q.current_index, None);
    }
}

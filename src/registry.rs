//! Registry of managed client windows.
//!
//! Maps each managed client window to the frame window wrapping it. This is
//! the single source of truth for "is this window currently managed"; the
//! tree leaf displaying a client is derived from the frame's tiling tree.
//!
//! Entries keep insertion order because focus cycling walks the registry in
//! that order, wrapping after the last entry.

use x11rb::protocol::xproto::Window;

/// One managed client and the frame wrapping it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientEntry {
    pub window: Window,
    pub frame: Window,
}

#[derive(Debug, Default)]
pub struct ClientRegistry {
    entries: Vec<ClientEntry>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `window` as managed inside `frame`. Returns false (and leaves
    /// the registry untouched) if the window is already registered.
    pub fn insert(&mut self, window: Window, frame: Window) -> bool {
        if self.contains(window) {
            return false;
        }
        self.entries.push(ClientEntry { window, frame });
        true
    }

    /// Deregister `window`. Unknown windows are a no-op, not an error.
    pub fn remove(&mut self, window: Window) -> Option<ClientEntry> {
        let idx = self.entries.iter().position(|e| e.window == window)?;
        Some(self.entries.remove(idx))
    }

    pub fn contains(&self, window: Window) -> bool {
        self.entries.iter().any(|e| e.window == window)
    }

    /// The frame wrapping `window`, if it is managed
    pub fn frame_of(&self, window: Window) -> Option<Window> {
        self.entries
            .iter()
            .find(|e| e.window == window)
            .map(|e| e.frame)
    }

    /// Next entry after `window` in insertion order, wrapping to the first
    /// entry after the last. Starts from the first entry when `window` is not
    /// registered. `None` only when the registry is empty.
    pub fn next_after(&self, window: Window) -> Option<ClientEntry> {
        if self.entries.is_empty() {
            return None;
        }
        let next = match self.entries.iter().position(|e| e.window == window) {
            Some(idx) => (idx + 1) % self.entries.len(),
            None => 0,
        };
        Some(self.entries[next])
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_lookup() {
        let mut reg = ClientRegistry::new();
        assert!(reg.insert(0x10, 0xf1));
        assert!(reg.insert(0x20, 0xf1));
        assert!(reg.contains(0x10));
        assert_eq!(reg.frame_of(0x20), Some(0xf1));
        assert_eq!(reg.frame_of(0x30), None);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut reg = ClientRegistry::new();
        assert!(reg.insert(0x10, 0xf1));
        assert!(!reg.insert(0x10, 0xf2));
        // The original mapping survives.
        assert_eq!(reg.frame_of(0x10), Some(0xf1));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn remove_unknown_is_noop() {
        let mut reg = ClientRegistry::new();
        reg.insert(0x10, 0xf1);
        assert_eq!(reg.remove(0x99), None);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn cycling_follows_insertion_order_and_wraps() {
        let mut reg = ClientRegistry::new();
        reg.insert(0x30, 0xf3);
        reg.insert(0x10, 0xf1);
        reg.insert(0x20, 0xf2);

        // Insertion order, not window-id order.
        assert_eq!(reg.next_after(0x30).unwrap().window, 0x10);
        assert_eq!(reg.next_after(0x10).unwrap().window, 0x20);
        // Wraps after the last entry.
        assert_eq!(reg.next_after(0x20).unwrap().window, 0x30);
    }

    #[test]
    fn cycling_from_unknown_window_starts_at_first() {
        let mut reg = ClientRegistry::new();
        reg.insert(0x10, 0xf1);
        reg.insert(0x20, 0xf2);
        assert_eq!(reg.next_after(0x99).unwrap().window, 0x10);
    }

    #[test]
    fn cycling_empty_registry_yields_none() {
        let reg = ClientRegistry::new();
        assert_eq!(reg.next_after(0x10), None);
    }

    #[test]
    fn removal_preserves_cycle_order() {
        let mut reg = ClientRegistry::new();
        reg.insert(0x10, 0xf1);
        reg.insert(0x20, 0xf2);
        reg.insert(0x30, 0xf3);
        reg.remove(0x20);
        assert_eq!(reg.next_after(0x10).unwrap().window, 0x30);
        assert_eq!(reg.next_after(0x30).unwrap().window, 0x10);
    }
}

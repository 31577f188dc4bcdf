use std::collections::BTreeSet;

/// Channel id allocator for one connection.
///
/// Next-fit over `1..=max`: a released id is handed out again only after the
/// cursor wraps around to it.
#[derive(Debug)]
pub(crate) struct ChannelIds {
    max: u16,
    cursor: u16,
    in_use: BTreeSet<u16>,
}

impl ChannelIds {
    pub(crate) fn new(max: u16) -> Self {
        Self {
            max,
            cursor: 1,
            in_use: BTreeSet::new(),
        }
    }

    pub(crate) fn allocate(&mut self) -> Option<u16> {
        if self.max == 0 || self.in_use.len() >= usize::from(self.max) {
            return None;
        }
        for _ in 0..self.max {
            let candidate = self.cursor;
            self.cursor = if self.cursor >= self.max {
                1
            } else {
                self.cursor + 1
            };
            if self.in_use.insert(candidate) {
                return Some(candidate);
            }
        }
        None
    }

    pub(crate) fn release(&mut self, id: u16) {
        self.in_use.remove(&id);
    }

    pub(crate) fn max(&self) -> u16 {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_sequentially_from_one() {
        let mut ids = ChannelIds::new(10);
        assert_eq!(ids.allocate(), Some(1));
        assert_eq!(ids.allocate(), Some(2));
        assert_eq!(ids.allocate(), Some(3));
    }

    #[test]
    fn exhausts_at_max() {
        let mut ids = ChannelIds::new(2);
        assert_eq!(ids.allocate(), Some(1));
        assert_eq!(ids.allocate(), Some(2));
        assert_eq!(ids.allocate(), None);

        ids.release(1);
        assert_eq!(ids.allocate(), Some(1));
    }

    #[test]
    fn released_ids_are_not_reused_before_wrap() {
        let mut ids = ChannelIds::new(4);
        let first = ids.allocate().expect("id should be free");
        ids.release(first);
        assert_eq!(ids.allocate(), Some(2));
        assert_eq!(ids.allocate(), Some(3));
        assert_eq!(ids.allocate(), Some(4));
        assert_eq!(ids.allocate(), Some(1));
    }
}

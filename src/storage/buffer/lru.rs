use super::replacer::{FrameId, Replacer, VictimClass};
use std::collections::{HashSet, VecDeque};

#[derive(Debug)]
pub struct LruReplacer {
    /// Queue of evictable frames (least recently used at front)
    lru_list: VecDeque<FrameId>,
    /// Membership of `lru_list`
    members: HashSet<FrameId>,
    /// Maximum number of frames
    max_size: usize,
}

impl LruReplacer {
    pub fn new(max_size: usize) -> Self {
        Self {
            lru_list: VecDeque::with_capacity(max_size),
            members: HashSet::with_capacity(max_size),
            max_size,
        }
    }

    fn remove_at(&mut self, idx: usize) -> Option<FrameId> {
        let frame_id = self.lru_list.remove(idx)?;
        self.members.remove(&frame_id);
        Some(frame_id)
    }
}

impl Replacer for LruReplacer {
    fn victim(&mut self, classify: &dyn Fn(FrameId) -> VictimClass) -> Option<FrameId> {
        let mut first_dirty = None;
        for (idx, &frame_id) in self.lru_list.iter().enumerate() {
            match classify(frame_id) {
                VictimClass::Clean => return self.remove_at(idx),
                VictimClass::Dirty if first_dirty.is_none() => first_dirty = Some(idx),
                _ => {}
            }
        }
        first_dirty.and_then(|idx| self.remove_at(idx))
    }

    fn pin(&mut self, frame_id: FrameId) {
        if self.members.remove(&frame_id) {
            if let Some(idx) = self.lru_list.iter().position(|&f| f == frame_id) {
                self.lru_list.remove(idx);
            }
        }
    }

    fn unpin(&mut self, frame_id: FrameId) {
        if !self.members.contains(&frame_id) && self.lru_list.len() < self.max_size {
            self.lru_list.push_back(frame_id);
            self.members.insert(frame_id);
        }
    }

    fn size(&self) -> usize {
        self.lru_list.len()
    }
}

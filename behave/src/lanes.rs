use std::fmt;

use crate::NodeId;

/// Identity of a lane that survives index shifts caused by aborts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct LaneId(pub u32);

impl fmt::Display for LaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// One call-stack entry: a node plus how far it got through its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Frame {
    pub node: NodeId,
    pub child_index: u16,
}

impl Frame {
    #[inline]
    #[must_use]
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            child_index: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Lane {
    pub frame_offset: usize,
    pub frame_count: usize,
    /// Index of the lane that spawned this one, `None` for the primary lane.
    pub owner: Option<usize>,
    pub wait_start: f64,
    pub id: LaneId,
}

/// All lanes of one agent sharing a single frame arena.
///
/// Lane `i` owns `frames[lanes[i].frame_offset..end]` where `end` is the
/// next lane's offset (or the arena length for the last lane); only the
/// first `frame_count` entries of that region are live. Lanes appear in
/// creation order, so regions never overlap and leave no gaps.
#[derive(Debug, Clone)]
pub struct LaneStack {
    lanes: Vec<Lane>,
    frames: Vec<Frame>,
    block: usize,
}

impl LaneStack {
    /// `block` is the number of frames the arena grows by whenever a lane
    /// runs into its successor.
    #[must_use]
    pub fn new(frame_capacity: usize, block: usize) -> Self {
        assert!(block > 0, "lane block size must be positive");
        Self {
            lanes: Vec::new(),
            frames: vec![Frame::default(); frame_capacity],
            block,
        }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    #[must_use]
    pub fn lanes(&self) -> &[Lane] {
        &self.lanes
    }

    #[inline]
    #[must_use]
    pub fn lane(&self, lane: usize) -> &Lane {
        &self.lanes[lane]
    }

    #[inline]
    pub fn lane_mut(&mut self, lane: usize) -> &mut Lane {
        &mut self.lanes[lane]
    }

    /// Size of the shared arena, live or not.
    #[must_use]
    pub fn arena_len(&self) -> usize {
        self.frames.len()
    }

    /// Live frames of `lane`, bottom first.
    #[must_use]
    pub fn frames(&self, lane: usize) -> &[Frame] {
        let l = &self.lanes[lane];
        &self.frames[l.frame_offset..l.frame_offset + l.frame_count]
    }

    #[inline]
    #[must_use]
    pub fn depth(&self, lane: usize) -> usize {
        self.lanes[lane].frame_count
    }

    #[must_use]
    pub fn top(&self, lane: usize) -> Option<Frame> {
        self.frames(lane).last().copied()
    }

    pub fn top_mut(&mut self, lane: usize) -> Option<&mut Frame> {
        let l = self.lanes[lane];
        if l.frame_count == 0 {
            return None;
        }
        Some(&mut self.frames[l.frame_offset + l.frame_count - 1])
    }

    /// First index past the region `lane` may grow into.
    fn region_end(&self, lane: usize) -> usize {
        self.lanes
            .get(lane + 1)
            .map_or(self.frames.len(), |next| next.frame_offset)
    }

    /// Grows the arena by one block and moves every later lane's frames up
    /// by that block.
    fn make_room(&mut self, lane: usize) {
        let start = self.region_end(lane);
        let old_len = self.frames.len();
        self.frames.resize(old_len + self.block, Frame::default());
        self.frames.copy_within(start..old_len, start + self.block);
        for later in &mut self.lanes[lane + 1..] {
            later.frame_offset += self.block;
        }
        log::trace!(
            "lane {lane} grew into its successor, arena now {} frames",
            self.frames.len()
        );
    }

    pub fn push(&mut self, lane: usize, frame: Frame) {
        let l = self.lanes[lane];
        let slot = l.frame_offset + l.frame_count;
        if slot == self.region_end(lane) {
            self.make_room(lane);
        }
        self.frames[slot] = frame;
        self.lanes[lane].frame_count += 1;
    }

    pub fn pop(&mut self, lane: usize) -> Option<Frame> {
        let frame = self.top(lane)?;
        self.lanes[lane].frame_count -= 1;
        Some(frame)
    }

    /// Drops frames above `depth`.
    pub fn truncate(&mut self, lane: usize, depth: usize) {
        let l = &mut self.lanes[lane];
        l.frame_count = l.frame_count.min(depth);
    }

    /// Creates the primary lane with `root` as its only frame.
    pub fn create_primary(&mut self, root: NodeId, id: LaneId) {
        assert!(self.lanes.is_empty(), "primary lane already exists");
        self.lanes.push(Lane {
            frame_offset: 0,
            frame_count: 0,
            owner: None,
            wait_start: 0.0,
            id,
        });
        self.push(0, Frame::new(root));
    }

    /// Appends a lane owned by `owner` right after the last lane's live
    /// frames and returns its index.
    pub fn spawn(&mut self, owner: usize, root: NodeId, id: LaneId) -> usize {
        assert!(owner < self.lanes.len(), "spawning from missing lane");
        let offset = self
            .lanes
            .last()
            .map_or(0, |l| l.frame_offset + l.frame_count);
        self.lanes.push(Lane {
            frame_offset: offset,
            frame_count: 0,
            owner: Some(owner),
            wait_start: 0.0,
            id,
        });
        let index = self.lanes.len() - 1;
        self.push(index, Frame::new(root));
        index
    }

    /// Newest lane owned by `owner` whose bottom frame is `root`.
    #[must_use]
    pub fn find_owned(&self, owner: usize, root: NodeId) -> Option<usize> {
        (0..self.lanes.len()).rev().find(|&i| {
            self.lanes[i].owner == Some(owner)
                && self.frames(i).first().map(|f| f.node) == Some(root)
        })
    }

    /// Removes `lane` and, first, every lane it transitively owns. Returns
    /// the removed lanes, innermost first.
    pub fn abort(&mut self, lane: usize) -> Vec<Lane> {
        assert!(lane > 0, "the primary lane cannot be aborted");
        assert!(lane < self.lanes.len(), "aborting missing lane {lane}");
        let mut removed = Vec::new();
        self.abort_into(lane, &mut removed);
        removed
    }

    fn abort_into(&mut self, lane: usize, removed: &mut Vec<Lane>) {
        // owned lanes always sit above their owner, so removing them never
        // moves `lane`
        while let Some(owned) =
            self.lanes.iter().rposition(|l| l.owner == Some(lane))
        {
            self.abort_into(owned, removed);
        }
        removed.push(self.lanes.remove(lane));
        for l in &mut self.lanes {
            if let Some(owner) = l.owner.as_mut() {
                if *owner > lane {
                    *owner -= 1;
                }
            }
        }
    }

    /// Discards every lane. The arena keeps its size.
    pub fn reset(&mut self) {
        self.lanes.clear();
    }

    /// Panics if the lane regions do not partition the arena.
    pub fn check_invariants(&self) {
        let mut primaries = 0;
        for (i, lane) in self.lanes.iter().enumerate() {
            let end = self.region_end(i);
            assert!(
                lane.frame_offset + lane.frame_count <= end,
                "lane {i} overflows into its successor"
            );
            if i == 0 {
                assert_eq!(lane.frame_offset, 0, "first lane must start at 0");
            } else {
                assert!(
                    self.lanes[i - 1].frame_offset <= lane.frame_offset,
                    "lane {i} starts before its predecessor"
                );
            }
            match lane.owner {
                None => primaries += 1,
                Some(owner) => assert!(
                    owner < i,
                    "lane {i} is owned by later lane {owner}"
                ),
            }
        }
        if !self.lanes.is_empty() {
            assert_eq!(primaries, 1, "exactly one primary lane expected");
            assert!(self.lanes[0].owner.is_none(), "lane 0 must be primary");
        }
    }
}

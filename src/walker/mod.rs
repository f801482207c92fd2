// Walkers and the index descent that drives them.
//
// A walker is offered weights in walk order, either of single elements or of
// whole index cells, and decides whether the target lies inside the weight it
// was just offered. The descent code never looks at the target itself: it
// scans sibling groups, descends into the cell the walker stops at, and goes
// up a level when a group is exhausted.

use serde::Serialize;

use crate::index::ColumnView;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    /// Stop where the running sum first reaches the target.
    GE,
    /// Stop where the running sum first exceeds the target.
    GT,
}

/// What is being summed during a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Measure {
    Sum,
    /// Occurrences of one symbol. Only valid for symbol sequences.
    Symbol(usize),
}

impl Measure {
    pub fn lane(&self) -> usize {
        match self {
            Measure::Sum => 0,
            Measure::Symbol(s) => 1 + s,
        }
    }

    pub fn weight(&self, value: u64) -> u64 {
        match self {
            Measure::Sum => value,
            Measure::Symbol(s) => (value == *s as u64) as u64,
        }
    }
}

pub trait Walker {
    /// Offers the weight of the next element or cell. Returns true if the walk
    /// should stop inside it.
    fn compare(&mut self, weight: u64) -> bool;

    /// Accepts the weight last offered to `compare`.
    fn next(&mut self);

    /// Sum of every accepted weight.
    fn prefix(&self) -> u64;
}

#[derive(Debug, Clone)]
pub struct FindGeWalker {
    target: u64,
    sum: u64,
    next: u64,
}

impl FindGeWalker {
    pub fn new(target: u64) -> Self {
        FindGeWalker {
            target,
            sum: 0,
            next: 0,
        }
    }
}

impl Walker for FindGeWalker {
    fn compare(&mut self, weight: u64) -> bool {
        self.next = weight;
        self.sum.saturating_add(weight) >= self.target
    }

    fn next(&mut self) {
        self.sum += self.next;
    }

    fn prefix(&self) -> u64 {
        self.sum
    }
}

#[derive(Debug, Clone)]
pub struct FindGtWalker {
    target: u64,
    sum: u64,
    next: u64,
}

impl FindGtWalker {
    pub fn new(target: u64) -> Self {
        FindGtWalker {
            target,
            sum: 0,
            next: 0,
        }
    }
}

impl Walker for FindGtWalker {
    fn compare(&mut self, weight: u64) -> bool {
        self.next = weight;
        self.sum.saturating_add(weight) > self.target
    }

    fn next(&mut self) {
        self.sum += self.next;
    }

    fn prefix(&self) -> u64 {
        self.sum
    }
}

/// Outcome of a find. `idx` is the stopping element, or `size` (forward) or
/// `-1` (backward) when the target was never reached. `prefix` is the sum of
/// the weights walked over before `idx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FindResult {
    pub idx: isize,
    pub prefix: u64,
}

impl FindResult {
    pub fn found(&self, size: usize) -> bool {
        self.idx >= 0 && (self.idx as usize) < size
    }
}

/// Runs `walker` over `[start, size)` and returns where it stopped.
pub fn walk_fw<W: Walker>(view: &ColumnView, start: usize, measure: Measure, walker: &mut W) -> isize {
    let size = view.size();
    let vpb = view.values_per_branch();
    if start >= size {
        return size as isize;
    }

    // Short walks never pay for the descent.
    let leaf = match view.tree().leaf_level() {
        Some(leaf) if start + 2 * vpb < size => leaf,
        _ => return linear_fw(view, start, size, measure, walker),
    };

    let window_end = (start / vpb + 1) * vpb;
    let idx = linear_fw(view, start, window_end, measure, walker);
    if (idx as usize) < window_end {
        return idx;
    }

    match walk_index_fw(view, leaf, window_end / vpb, measure, walker) {
        Some(window) => linear_fw(view, window * vpb, size, measure, walker),
        None => size as isize,
    }
}

/// Runs `walker` over `[0, start]` in reverse and returns where it stopped.
pub fn walk_bw<W: Walker>(view: &ColumnView, start: usize, measure: Measure, walker: &mut W) -> isize {
    let size = view.size();
    let vpb = view.values_per_branch();
    if size == 0 {
        return -1;
    }
    assert!(start < size, "walk start {} out of bounds for size {}", start, size);

    let leaf = match view.tree().leaf_level() {
        Some(leaf) if start >= 2 * vpb => leaf,
        _ => return linear_bw(view, start, 0, measure, walker),
    };

    let window_start = (start / vpb) * vpb;
    let idx = linear_bw(view, start, window_start, measure, walker);
    if idx >= window_start as isize {
        return idx;
    }

    match walk_index_bw(view, leaf, start / vpb - 1, measure, walker) {
        Some(window) => {
            let last = std::cmp::min((window + 1) * vpb, size) - 1;
            linear_bw(view, last, 0, measure, walker)
        }
        None => -1,
    }
}

fn linear_fw<W: Walker>(
    view: &ColumnView,
    from: usize,
    to: usize,
    measure: Measure,
    walker: &mut W,
) -> isize {
    for (i, v) in view.cursor(from).take(to - from).enumerate() {
        if walker.compare(measure.weight(v)) {
            return (from + i) as isize;
        }
        walker.next();
    }
    to as isize
}

// Walks `[to, from]` backwards, one window at a time.
fn linear_bw<W: Walker>(
    view: &ColumnView,
    from: usize,
    to: usize,
    measure: Measure,
    walker: &mut W,
) -> isize {
    let vpb = view.values_per_branch();
    let mut window = Vec::with_capacity(vpb);
    let mut hi = from;
    loop {
        let lo = std::cmp::max((hi / vpb) * vpb, to);
        view.decode_into(lo, hi + 1, &mut window);
        for (i, v) in window.iter().enumerate().rev() {
            if walker.compare(measure.weight(*v)) {
                return (lo + i) as isize;
            }
            walker.next();
        }
        if lo == to {
            return to as isize - 1;
        }
        hi = lo - 1;
    }
}

// Returns the leaf cell holding the stopping point, if any, starting the scan
// at cell `start` of `level`.
fn walk_index_fw<W: Walker>(
    view: &ColumnView,
    mut level: usize,
    mut start: usize,
    measure: Measure,
    walker: &mut W,
) -> Option<usize> {
    let tree = view.tree();
    let bf = view.branching_factor();
    let leaf = tree.levels.len() - 1;
    let lane = measure.lane();

    loop {
        let geo = tree.levels[level];
        let group_end = std::cmp::min((start / bf + 1) * bf, geo.size);

        let mut hit = None;
        for c in start..group_end {
            if walker.compare(view.cell(geo.start + c, lane)) {
                hit = Some(c);
                break;
            }
            walker.next();
        }

        match hit {
            Some(c) if level == leaf => return Some(c),
            Some(c) => {
                level += 1;
                start = c * bf;
            }
            None if level == 0 => return None,
            None => {
                start = start / bf + 1;
                level -= 1;
            }
        }
    }
}

fn walk_index_bw<W: Walker>(
    view: &ColumnView,
    mut level: usize,
    mut start: usize,
    measure: Measure,
    walker: &mut W,
) -> Option<usize> {
    let tree = view.tree();
    let bf = view.branching_factor();
    let leaf = tree.levels.len() - 1;
    let lane = measure.lane();

    loop {
        let geo = tree.levels[level];
        let group_start = (start / bf) * bf;
        let from = std::cmp::min(start, geo.size - 1);

        let mut hit = None;
        if group_start <= from {
            for c in (group_start..=from).rev() {
                if walker.compare(view.cell(geo.start + c, lane)) {
                    hit = Some(c);
                    break;
                }
                walker.next();
            }
        }

        match hit {
            Some(c) if level == leaf => return Some(c),
            Some(c) => {
                let child = tree.levels[level + 1];
                level += 1;
                start = std::cmp::min((c + 1) * bf, child.size) - 1;
            }
            None if level == 0 || group_start == 0 => return None,
            None => {
                start = group_start / bf - 1;
                level -= 1;
            }
        }
    }
}

/// Sum of `measure` over `[0, end)`: whole windows come from the index, the
/// tail of the last window is decoded.
pub fn prefix(view: &ColumnView, end: usize, measure: Measure) -> u64 {
    let vpb = view.values_per_branch();
    let bf = view.branching_factor();
    let lane = measure.lane();

    let mut sum = 0;
    let mut from = 0;
    if let Some(leaf) = view.tree().leaf_level() {
        let mut hi = end / vpb;
        from = hi * vpb;
        for level in (0..=leaf).rev() {
            if hi == 0 {
                break;
            }
            let lo = (hi / bf) * bf;
            for c in lo..hi {
                sum += view.level_cell(level, c, lane);
            }
            hi /= bf;
        }
    }

    for v in view.cursor(from).take(end - from) {
        sum += measure.weight(v);
    }
    sum
}

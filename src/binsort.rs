//! Hierarchical bucket sort keyed by collapse cost.
//!
//! Items are small integer handles. Each group splits its value range into
//! equal buckets; a bucket holding too many items turns into a nested group
//! and turns back into a flat list once it drains below a quarter of that.

const NONE: u32 = u32::MAX;

const ROOT_BUCKETS: usize = 64;
const GROUP_BUCKETS: usize = 16;
const MAX_DEPTH: usize = 6;
const MIN_GROUP_THRESHOLD: usize = 256;

#[derive(Debug, Clone, Copy)]
struct Link {
    prev: u32,
    next: u32,
    value: f64,
    queued: bool,
}

impl Default for Link {
    fn default() -> Self {
        Link {
            prev: NONE,
            next: NONE,
            value: 0.0,
            queued: false,
        }
    }
}

#[derive(Debug)]
enum Content {
    List(u32),
    Group(Box<Group>),
}

#[derive(Debug)]
struct Bucket {
    count: usize,
    content: Content,
}

#[derive(Debug)]
struct Group {
    base: f64,
    /// Width of a single bucket.
    range: f64,
    buckets: Vec<Bucket>,
}

impl Group {
    fn new(base: f64, span: f64, bucket_count: usize) -> Self {
        let span = if span > 0.0 && span.is_finite() {
            span
        } else {
            f64::MIN_POSITIVE * bucket_count as f64
        };
        Group {
            base,
            range: span / bucket_count as f64,
            buckets: (0..bucket_count)
                .map(|_| Bucket {
                    count: 0,
                    content: Content::List(NONE),
                })
                .collect(),
        }
    }

    fn bucket_index(&self, value: f64) -> usize {
        // saturating cast, NaN lands in the first bucket
        let index = ((value - self.base) / self.range).floor() as i64;
        index.clamp(0, self.buckets.len() as i64 - 1) as usize
    }

    /// Route every item of a flat list into this group.
    fn absorb(&mut self, links: &mut [Link], mut cursor: u32) {
        while cursor != NONE {
            let next = links[cursor as usize].next;
            let index = self.bucket_index(links[cursor as usize].value);
            let bucket = &mut self.buckets[index];
            bucket.count += 1;
            if let Content::List(head) = &mut bucket.content {
                push_front(head, links, cursor);
            }
            cursor = next;
        }
    }

    /// Move every item of this group and its children onto `head`.
    fn drain_into(self, head: &mut u32, links: &mut [Link]) {
        for bucket in self.buckets {
            match bucket.content {
                Content::List(mut cursor) => {
                    while cursor != NONE {
                        let next = links[cursor as usize].next;
                        push_front(head, links, cursor);
                        cursor = next;
                    }
                }
                Content::Group(sub) => sub.drain_into(head, links),
            }
        }
    }

    fn first(&self, links: &[Link], ceiling: f64) -> Option<u32> {
        let top = self.bucket_index(ceiling);
        for (index, bucket) in self.buckets[..=top].iter().enumerate() {
            if bucket.count == 0 {
                continue;
            }
            match &bucket.content {
                Content::List(head) if index < top => {
                    // the whole bucket sits below the ceiling
                    if *head != NONE {
                        return Some(*head);
                    }
                }
                Content::List(head) => {
                    let mut cursor = *head;
                    while cursor != NONE {
                        let link = &links[cursor as usize];
                        if link.value <= ceiling {
                            return Some(cursor);
                        }
                        cursor = link.next;
                    }
                }
                Content::Group(sub) => {
                    if let Some(item) = sub.first(links, ceiling) {
                        return Some(item);
                    }
                }
            }
        }
        None
    }
}

fn push_front(head: &mut u32, links: &mut [Link], item: u32) {
    let link = &mut links[item as usize];
    link.prev = NONE;
    link.next = *head;
    if *head != NONE {
        links[*head as usize].prev = item;
    }
    *head = item;
}

fn unlink(head: &mut u32, links: &mut [Link], item: u32) {
    let Link { prev, next, .. } = links[item as usize];
    if prev == NONE {
        *head = next;
    } else {
        links[prev as usize].next = next;
    }
    if next != NONE {
        links[next as usize].prev = prev;
    }
    let link = &mut links[item as usize];
    link.prev = NONE;
    link.next = NONE;
}

/// Approximate priority queue over `f64` keys.
#[derive(Debug)]
pub struct BinSort {
    root: Group,
    links: Vec<Link>,
    group_threshold: usize,
    collapse_threshold: usize,
    len: usize,
}

impl BinSort {
    /// Queue sized for costs up to `max_cost` on a mesh of
    /// `triangle_count` triangles.
    pub fn new(max_cost: f64, triangle_count: usize) -> Self {
        let threshold = MIN_GROUP_THRESHOLD.max(triangle_count >> 9);
        Self::with_threshold(-0.2 * max_cost, 1.2 * max_cost, threshold)
    }

    pub(crate) fn with_threshold(lower: f64, upper: f64, group_threshold: usize) -> Self {
        let group_threshold = group_threshold.max(1);
        BinSort {
            root: Group::new(lower, upper - lower, ROOT_BUCKETS),
            links: Vec::new(),
            group_threshold,
            collapse_threshold: group_threshold >> 2,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, item: u32) -> bool {
        self.links
            .get(item as usize)
            .map(|link| link.queued)
            .unwrap_or(false)
    }

    /// Key stored for a queued item.
    #[cfg(test)]
    pub fn value(&self, item: u32) -> Option<f64> {
        self.links
            .get(item as usize)
            .filter(|link| link.queued)
            .map(|link| link.value)
    }

    /// Insert `item` with key `value`, an already queued item is re-keyed.
    pub fn add(&mut self, item: u32, value: f64) {
        if self.contains(item) {
            self.remove(item);
        }
        let slot = item as usize;
        if slot >= self.links.len() {
            self.links.resize(slot + 1, Link::default());
        }
        self.links[slot] = Link {
            prev: NONE,
            next: NONE,
            value,
            queued: true,
        };
        self.len += 1;

        let (threshold, links) = (self.group_threshold, &mut self.links);
        let mut group = &mut self.root;
        let mut depth = 0;
        loop {
            let index = group.bucket_index(value);
            let sub_base = group.base + index as f64 * group.range;
            let sub_span = group.range;
            let bucket = &mut group.buckets[index];
            bucket.count += 1;

            if let Content::List(head) = &mut bucket.content {
                if bucket.count < threshold || depth >= MAX_DEPTH {
                    push_front(head, links, item);
                    return;
                }
                let mut sub = Group::new(sub_base, sub_span, GROUP_BUCKETS);
                sub.absorb(links, *head);
                bucket.content = Content::Group(Box::new(sub));
            }
            match &mut bucket.content {
                Content::Group(sub) => {
                    group = &mut **sub;
                    depth += 1;
                }
                Content::List(_) => return,
            }
        }
    }

    /// Remove `item`, returns false when it was not queued.
    pub fn remove(&mut self, item: u32) -> bool {
        if !self.contains(item) {
            return false;
        }
        let value = self.links[item as usize].value;
        let (collapse, links) = (self.collapse_threshold, &mut self.links);
        let mut group = &mut self.root;
        loop {
            let index = group.bucket_index(value);
            let bucket = &mut group.buckets[index];
            bucket.count = bucket.count.saturating_sub(1);

            if let Content::List(head) = &mut bucket.content {
                unlink(head, links, item);
                break;
            }
            if bucket.count < collapse {
                let mut head = NONE;
                if let Content::Group(sub) =
                    std::mem::replace(&mut bucket.content, Content::List(NONE))
                {
                    sub.drain_into(&mut head, links);
                }
                unlink(&mut head, links, item);
                bucket.content = Content::List(head);
                break;
            }
            match &mut bucket.content {
                Content::Group(sub) => group = &mut **sub,
                Content::List(_) => break,
            }
        }
        links[item as usize].queued = false;
        self.len -= 1;
        true
    }

    /// Move `item` to key `value`.
    pub fn update(&mut self, item: u32, value: f64) {
        self.remove(item);
        self.add(item, value);
    }

    /// Some queued item whose key is at most `ceiling`.
    ///
    /// Items come out in approximately increasing order: the bucket holding
    /// the returned item is the lowest non-empty one, but items inside a
    /// bucket are unordered.
    pub fn first(&self, ceiling: f64) -> Option<u32> {
        if self.len == 0 {
            return None;
        }
        self.root.first(&self.links, ceiling)
    }
}

use std::sync::Arc;

use super::segment::SegmentReference;

/// Time-ordered list of the segment references of one stream.
#[derive(Debug, Default)]
pub struct SegmentIndex {
    references: Vec<Arc<SegmentReference>>,
}

impl SegmentIndex {
    pub fn new(mut references: Vec<Arc<SegmentReference>>) -> Self {
        references.sort_by(|a, b| a.start_time().total_cmp(&b.start_time()));
        Self { references }
    }

    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    pub fn get(&self, position: usize) -> Option<&Arc<SegmentReference>> {
        self.references.get(position)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<SegmentReference>> {
        self.references.iter()
    }

    /// Position of the reference containing `time`.
    ///
    /// A reference spans from its start to the start of the next one, so
    /// gaps belong to the earlier reference. Times before the first reference
    /// map to the first one; times past the end map to nothing.
    pub fn find(&self, time: f64) -> Option<usize> {
        let count = self.references.len();
        for (i, reference) in self.references.iter().enumerate().rev() {
            let end = if i + 1 < count {
                self.references[i + 1].start_time()
            } else {
                reference.end_time()
            };
            if time >= reference.start_time() && time < end {
                return Some(i);
            }
        }
        match self.references.first() {
            Some(first) if time < first.start_time() => Some(0),
            _ => None,
        }
    }

    /// Iterator whose first `next()` yields the reference (or partial
    /// reference) containing `time`.
    ///
    /// When `allow_non_independent` is false the iterator backs up to the
    /// closest independent partial, or to the start of the parent segment
    /// when there is none.
    pub fn iterator_for_time(
        self: &Arc<Self>,
        time: f64,
        allow_non_independent: bool,
        reverse: bool,
    ) -> Option<SegmentIterator> {
        let position = self.find(time)?;
        let reference = self.get(position)?;

        let mut partial = None;
        let partials = reference.partial_references();
        if let Some(found) = partials
            .iter()
            .rposition(|p| time >= p.start_time() && time < p.end_time())
        {
            partial = if allow_non_independent {
                Some(found)
            } else {
                partials[..=found]
                    .iter()
                    .rposition(|p| p.is_independent())
                    .or(Some(0))
            };
        } else if !partials.is_empty() {
            partial = Some(0);
        }

        Some(SegmentIterator {
            index: Arc::clone(self),
            position: position as isize,
            partial,
            primed: true,
            reverse,
        })
    }
}

/// Cursor over a [`SegmentIndex`], descending into partial references.
#[derive(Debug, Clone)]
pub struct SegmentIterator {
    index: Arc<SegmentIndex>,
    position: isize,
    partial: Option<usize>,
    /// The next call to `next()` yields the current element without moving.
    primed: bool,
    reverse: bool,
}

impl SegmentIterator {
    /// Element yielded by the last `next()`, or the element the first `next()`
    /// will yield when nothing has been yielded yet.
    pub fn current(&self) -> Option<Arc<SegmentReference>> {
        if self.position < 0 {
            return None;
        }
        let reference = self.index.get(self.position as usize)?;
        match self.partial {
            Some(partial) if reference.has_partials() => {
                reference.partial_references().get(partial).cloned()
            }
            _ => Some(Arc::clone(reference)),
        }
    }

    /// Position of the current full segment within the index.
    pub fn current_position(&self) -> isize {
        self.position
    }

    pub fn is_reverse(&self) -> bool {
        self.reverse
    }

    pub fn set_reverse(&mut self, reverse: bool) {
        self.reverse = reverse;
    }

    fn advance(&mut self) {
        let partial_count = if self.position >= 0 {
            self.index
                .get(self.position as usize)
                .map(|r| r.partial_references().len())
                .unwrap_or(0)
        } else {
            0
        };

        if !self.reverse {
            match self.partial {
                Some(partial) if partial + 1 < partial_count => {
                    self.partial = Some(partial + 1);
                }
                _ => {
                    self.position += 1;
                    self.partial = self.partials_at(self.position).map(|_| 0);
                }
            }
        } else {
            match self.partial {
                Some(partial) if partial > 0 && partial_count > 0 => {
                    self.partial = Some(partial - 1);
                }
                _ => {
                    self.position -= 1;
                    self.partial = self.partials_at(self.position).map(|count| count - 1);
                }
            }
        }
    }

    fn partials_at(&self, position: isize) -> Option<usize> {
        if position < 0 {
            return None;
        }
        let count = self.index.get(position as usize)?.partial_references().len();
        (count > 0).then_some(count)
    }
}

impl Iterator for SegmentIterator {
    type Item = Arc<SegmentReference>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.primed {
            self.primed = false;
        } else {
            self.advance();
        }
        self.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn index(bounds: &[(f64, f64)]) -> Arc<SegmentIndex> {
        Arc::new(SegmentIndex::new(
            bounds
                .iter()
                .enumerate()
                .map(|(i, (start, end))| {
                    Arc::new(SegmentReference::new(*start, *end, vec![format!("seg{i}.m4s")]))
                })
                .collect(),
        ))
    }

    #[rstest]
    #[case(0.0, Some(0))]
    #[case(1.9, Some(0))]
    #[case(2.0, Some(1))]
    #[case(5.0, Some(2))]
    #[case(-3.0, Some(0))]
    #[case(6.0, None)]
    fn test_find(#[case] time: f64, #[case] expected: Option<usize>) {
        let index = index(&[(0.0, 2.0), (2.0, 4.0), (4.0, 6.0)]);
        assert_eq!(index.find(time), expected);
    }

    #[test]
    fn test_find_assigns_gap_to_previous_segment() {
        let index = index(&[(0.0, 2.0), (3.0, 5.0)]);
        assert_eq!(index.find(2.5), Some(0));
    }

    #[test]
    fn test_iterator_forward_and_reverse() {
        let index = index(&[(0.0, 2.0), (2.0, 4.0), (4.0, 6.0)]);
        let mut iterator = index.iterator_for_time(2.5, false, false).unwrap();
        assert_eq!(iterator.current().unwrap().start_time(), 2.0);
        assert_eq!(iterator.next().unwrap().start_time(), 2.0);
        assert_eq!(iterator.next().unwrap().start_time(), 4.0);
        assert!(iterator.next().is_none());

        let mut iterator = index.iterator_for_time(2.5, false, true).unwrap();
        assert_eq!(iterator.next().unwrap().start_time(), 2.0);
        assert_eq!(iterator.next().unwrap().start_time(), 0.0);
        assert_eq!(iterator.current_position(), 0);
        assert!(iterator.next().is_none());
    }

    #[test]
    fn test_iterator_walks_partials() {
        let parent = SegmentReference::new(0.0, 2.0, vec!["p.m4s".into()]).with_partials(vec![
            SegmentReference::new(0.0, 1.0, vec!["p.0".into()]),
            SegmentReference::new(1.0, 2.0, vec!["p.1".into()]).with_independent(false),
        ]);
        let index = Arc::new(SegmentIndex::new(vec![
            Arc::new(parent),
            Arc::new(SegmentReference::new(2.0, 4.0, vec!["n.m4s".into()])),
        ]));

        let mut iterator = index.iterator_for_time(1.5, true, false).unwrap();
        assert_eq!(iterator.next().unwrap().uris()[0], "p.1");
        assert_eq!(iterator.next().unwrap().uris()[0], "n.m4s");

        // Without non-independent partials the iterator backs up to p.0.
        let mut iterator = index.iterator_for_time(1.5, false, false).unwrap();
        assert_eq!(iterator.next().unwrap().uris()[0], "p.0");
        assert_eq!(iterator.next().unwrap().uris()[0], "p.1");
        assert_eq!(iterator.current_position(), 0);
    }
}

//! Per-function exception descriptor blocks.
//!
//! Each record covers a code range. The unwinder walks the block in
//! order, so nested try statements append their records innermost first
//! (a try statement finalizes its descriptors when it ends).

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerKind {
    /// Marks a try block; `direct` try blocks may catch runtime-raised
    /// exceptions that were never allocated, so entering one bumps the
    /// thread's context index.
    BeginTry { direct: bool },
    /// An `except` clause: the caught exception is stored into `slot` and
    /// execution resumes at `handler`.
    Except {
        slot: u32,
        handler: u32,
        caught_global: u32,
    },
    /// A `finally` clause: the discriminator slot pair starts at `slot`
    /// and execution resumes at `handler`.
    Finally { slot: u32, handler: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionRange {
    pub start: u32,
    pub end: u32,
    /// Number of enclosing direct try contexts at the handler entry,
    /// relative to the function entry. The unwinder restores the context
    /// index to this depth when it resumes in the handler.
    pub ctx_depth: u32,
    pub kind: HandlerKind,
}

impl ExceptionRange {
    pub fn covers(&self, offset: u32) -> bool {
        self.start <= offset && offset < self.end
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExceptionTable {
    pub entries: Vec<ExceptionRange>,
}

impl ExceptionTable {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All handler records whose range covers `offset`, innermost first.
    pub fn covering(&self, offset: u32) -> impl Iterator<Item = &ExceptionRange> {
        self.entries.iter().filter(move |e| e.covers(offset))
    }

    /// The innermost finally handler covering `offset` other than the one
    /// whose handler is at `after`, used to chain finally blocks.
    pub fn enclosing_finally(&self, offset: u32, after: u32) -> Option<&ExceptionRange> {
        self.entries
            .iter()
            .find(|e| e.covers(offset) && matches!(e.kind, HandlerKind::Finally { handler, .. } if handler != after))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covering_is_innermost_first() {
        let table = ExceptionTable {
            entries: vec![
                ExceptionRange {
                    start: 10,
                    end: 20,
                    ctx_depth: 1,
                    kind: HandlerKind::Except {
                        slot: 3,
                        handler: 25,
                        caught_global: 7,
                    },
                },
                ExceptionRange {
                    start: 0,
                    end: 40,
                    ctx_depth: 0,
                    kind: HandlerKind::Finally {
                        slot: 0,
                        handler: 45,
                    },
                },
            ],
        };
        let hits: Vec<_> = table.covering(12).collect();
        assert_eq!(hits.len(), 2);
        assert!(matches!(hits[0].kind, HandlerKind::Except { .. }));
        assert_eq!(table.covering(30).count(), 1);
        assert_eq!(table.covering(40).count(), 0);
    }
}

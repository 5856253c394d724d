//! Heap Corruption Checker
//!
//! A read-only walk over every region that verifies the boundary tags and
//! free-list links, stopping at the first inconsistency. The checker never
//! writes heap memory and never panics; what to do with a report is up to
//! the caller.
//!
//! # Violation Classes
//! - `BoundaryBackward`: a node's preceding tag disagrees with the size of
//!   the node below it, while the node itself is otherwise sound. The node
//!   below is reported as overflowed, the node as corrupted.
//! - `BoundaryForward`: a node's size does not lead to a sound successor.
//!   Either the node overran its own header or the successor was hit; both
//!   candidate pairs are reported.
//! - `FreeListBackward`: `node.backward.forward != node`, or a list head
//!   node the class index does not name.
//! - `FreeListForward`: `node.forward.backward != node`.

use core::fmt;

use super::config::{HeapConfig, GRANULE};
use super::freelist::class_of;
use super::heap::Heap;
use super::node::{self, NodeInfo, NIL};
use super::region::Region;

/// Which invariant failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionKind {
    BoundaryBackward,
    BoundaryForward,
    FreeListBackward,
    FreeListForward,
}

impl fmt::Display for CorruptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BoundaryBackward => "boundary tag (backward)",
            Self::BoundaryForward => "boundary tag (forward)",
            Self::FreeListBackward => "free list (backward link)",
            Self::FreeListForward => "free list (forward link)",
        };
        f.write_str(name)
    }
}

/// One candidate explanation: `overflowed` ran into `corrupted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Suspects {
    /// Node suspected of writing past its bounds, when one can be named.
    pub overflowed: Option<NodeInfo>,
    /// Node whose header is inconsistent.
    pub corrupted: NodeInfo,
}

/// The free-list link that failed the symmetry check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkMismatch {
    /// Link value stored in the corrupted node (`u32::MAX` for none).
    pub link: u32,
    /// What the neighbour points back to, if the link could be followed.
    pub found: Option<u32>,
}

/// First violation found by the checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorruptionReport {
    pub kind: CorruptionKind,
    /// Index of the region the walk stopped in.
    pub region: usize,
    pub primary: Suspects,
    /// Second candidate pair for ambiguous boundary violations.
    pub alternate: Option<Suspects>,
    pub link: Option<LinkMismatch>,
}

impl CorruptionReport {
    /// Emit the full diagnostic dump through the log facade.
    pub fn log(&self) {
        log::error!("kmm: heap corruption in region {}: {}", self.region, self.kind);
        log_suspects(&self.primary);
        if let Some(alternate) = &self.alternate {
            log::error!("kmm: or alternatively:");
            log_suspects(alternate);
        }
        if let Some(link) = &self.link {
            match link.found {
                Some(found) => log::error!(
                    "kmm: link {:#x} points back to {:#x}",
                    link.link,
                    found
                ),
                None => log::error!("kmm: link {:#x} does not name a node", link.link),
            }
        }
    }
}

fn log_suspects(suspects: &Suspects) {
    log::error!("kmm: corrupted node: {}", suspects.corrupted);
    if let Some(overflowed) = &suspects.overflowed {
        log::error!("kmm: overflowed node: {}", overflowed);
    }
}

impl fmt::Display for CorruptionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} violation in region {} at {:#010x}",
            self.kind, self.region, self.primary.corrupted.addr
        )
    }
}

/// Validate every region of `heap`, in order.
pub fn check_heap(heap: &Heap<'_>) -> Result<(), CorruptionReport> {
    for (index, region) in heap.regions().iter().enumerate() {
        check_region(region, index, heap.config())?;
    }
    Ok(())
}

/// Validate one region, logging the report on failure.
pub(crate) fn check_region(
    region: &Region<'_>,
    index: usize,
    config: &HeapConfig,
) -> Result<(), CorruptionReport> {
    let result = Walker {
        region,
        index,
        config,
    }
    .run();
    if let Err(report) = &result {
        report.log();
    }
    result
}

struct Walker<'r, 'a> {
    region: &'r Region<'a>,
    index: usize,
    config: &'r HeapConfig,
}

impl Walker<'_, '_> {
    fn read(&self, offset: usize) -> Option<NodeInfo> {
        NodeInfo::read(&self.region.mem, offset, self.config)
    }

    /// Successor of `node` when its size is a plausible step.
    fn successor(&self, node: &NodeInfo) -> Option<NodeInfo> {
        let size = node.size as usize;
        if size < self.config.header_size() || size % GRANULE != 0 {
            return None;
        }
        let next = node.offset.checked_add(size)?;
        if next > self.region.tail {
            return None;
        }
        self.read(next)
    }

    /// Whether `node` is confirmed by its own successor's preceding tag.
    fn is_sound(&self, node: &NodeInfo) -> bool {
        if node.offset == self.region.tail {
            return node.size as usize == self.config.header_size();
        }
        self.successor(node)
            .is_some_and(|next| next.prev_size == node.size)
    }

    fn report(
        &self,
        kind: CorruptionKind,
        primary: Suspects,
        alternate: Option<Suspects>,
        link: Option<LinkMismatch>,
    ) -> CorruptionReport {
        CorruptionReport {
            kind,
            region: self.index,
            primary,
            alternate,
            link,
        }
    }

    fn run(&self) -> Result<(), CorruptionReport> {
        let Some(mut node) = self.read(0) else {
            return Ok(());
        };
        let mut prev: Option<NodeInfo> = None;
        loop {
            if node.is_free() {
                self.check_links(&node)?;
            }
            if node.offset == self.region.tail {
                if node.size as usize == self.config.header_size() {
                    return Ok(());
                }
                return Err(self.report(
                    CorruptionKind::BoundaryForward,
                    Suspects {
                        overflowed: prev,
                        corrupted: node,
                    },
                    None,
                    None,
                ));
            }

            let Some(next) = self.successor(&node) else {
                return Err(self.report(
                    CorruptionKind::BoundaryForward,
                    Suspects {
                        overflowed: prev,
                        corrupted: node,
                    },
                    None,
                    None,
                ));
            };
            if next.prev_size != node.size {
                return Err(if self.is_sound(&next) {
                    self.report(
                        CorruptionKind::BoundaryBackward,
                        Suspects {
                            overflowed: Some(node),
                            corrupted: next,
                        },
                        None,
                        None,
                    )
                } else {
                    self.report(
                        CorruptionKind::BoundaryForward,
                        Suspects {
                            overflowed: Some(node),
                            corrupted: next,
                        },
                        Some(Suspects {
                            overflowed: prev,
                            corrupted: node,
                        }),
                        None,
                    )
                });
            }
            prev = Some(node);
            node = next;
        }
    }

    fn check_links(&self, node: &NodeInfo) -> Result<(), CorruptionReport> {
        let mem = &self.region.mem;
        let hdr = self.config.header_size();
        let me = node.offset as u32;
        let (Some(forward), Some(backward)) = (
            node::read_forward(mem, node.offset),
            node::read_backward(mem, node.offset),
        ) else {
            return Err(self.report(
                CorruptionKind::BoundaryForward,
                Suspects {
                    overflowed: None,
                    corrupted: *node,
                },
                None,
                None,
            ));
        };

        let neighbour = |link: u32| {
            if node::is_node_offset(mem, link, hdr) {
                self.read(link as usize)
            } else {
                None
            }
        };

        if backward == NIL {
            let head = self.region.free.head(class_of(node.size));
            if head != me {
                return Err(self.report(
                    CorruptionKind::FreeListBackward,
                    Suspects {
                        overflowed: neighbour(head),
                        corrupted: *node,
                    },
                    None,
                    Some(LinkMismatch {
                        link: NIL,
                        found: Some(head),
                    }),
                ));
            }
        } else {
            let found = neighbour(backward).and_then(|_| node::read_forward(mem, backward as usize));
            if found != Some(me) {
                return Err(self.report(
                    CorruptionKind::FreeListBackward,
                    Suspects {
                        overflowed: neighbour(backward),
                        corrupted: *node,
                    },
                    None,
                    Some(LinkMismatch {
                        link: backward,
                        found,
                    }),
                ));
            }
        }

        if forward != NIL {
            let found = neighbour(forward).and_then(|_| node::read_backward(mem, forward as usize));
            if found != Some(me) {
                return Err(self.report(
                    CorruptionKind::FreeListForward,
                    Suspects {
                        overflowed: neighbour(forward),
                        corrupted: *node,
                    },
                    None,
                    Some(LinkMismatch {
                        link: forward,
                        found,
                    }),
                ));
            }
        }
        Ok(())
    }
}

//! Split layout of the panes in a tab.

use serde::{Deserialize, Serialize};

use crate::ids::{ServerId, TabId, TerminalId};

/// Smallest share of the container either side of a split may take.
pub const MIN_PANE_FRACTION: f32 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitDirection {
    Horizontal,
    Vertical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutNode {
    Leaf(TerminalId),
    Split {
        direction: SplitDirection,
        ratio: f32,
        first: Box<LayoutNode>,
        second: Box<LayoutNode>,
    },
}

pub fn clamp_ratio(ratio: f32) -> f32 {
    if !ratio.is_finite() {
        return 0.5;
    }
    ratio.clamp(MIN_PANE_FRACTION, 1.0 - MIN_PANE_FRACTION)
}

impl LayoutNode {
    pub fn contains(&self, pane: TerminalId) -> bool {
        match self {
            Self::Leaf(id) => *id == pane,
            Self::Split { first, second, .. } => first.contains(pane) || second.contains(pane),
        }
    }

    /// Panes in visual order.
    pub fn leaves(&self) -> Vec<TerminalId> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves(&self, out: &mut Vec<TerminalId>) {
        match self {
            Self::Leaf(id) => out.push(*id),
            Self::Split { first, second, .. } => {
                first.collect_leaves(out);
                second.collect_leaves(out);
            }
        }
    }

    /// Replace the leaf `target` with a split holding it and `new_pane`.
    /// Returns false if `target` is not in the tree.
    pub fn split(&mut self, target: TerminalId, new_pane: TerminalId, direction: SplitDirection) -> bool {
        match self {
            Self::Leaf(id) if *id == target => {
                *self = Self::Split {
                    direction,
                    ratio: 0.5,
                    first: Box::new(Self::Leaf(target)),
                    second: Box::new(Self::Leaf(new_pane)),
                };
                true
            }
            Self::Leaf(_) => false,
            Self::Split { first, second, .. } => {
                first.split(target, new_pane, direction) || second.split(target, new_pane, direction)
            }
        }
    }

    /// Remove `pane`, collapsing its parent split into the sibling.
    /// Returns `None` when the tree held only that pane.
    pub fn remove(self, pane: TerminalId) -> Option<LayoutNode> {
        match self {
            Self::Leaf(id) if id == pane => None,
            leaf @ Self::Leaf(_) => Some(leaf),
            Self::Split {
                direction,
                ratio,
                first,
                second,
            } => match ((*first).remove(pane), (*second).remove(pane)) {
                (Some(first), Some(second)) => Some(Self::Split {
                    direction,
                    ratio,
                    first: Box::new(first),
                    second: Box::new(second),
                }),
                (Some(only), None) | (None, Some(only)) => Some(only),
                (None, None) => None,
            },
        }
    }

    /// Set the ratio of the innermost split containing `pane`.
    pub fn set_ratio_for(&mut self, pane: TerminalId, ratio: f32) -> bool {
        match self {
            Self::Leaf(_) => false,
            Self::Split {
                ratio: current,
                first,
                second,
                ..
            } => {
                if !first.contains(pane) && !second.contains(pane) {
                    return false;
                }
                if first.set_ratio_for(pane, ratio) || second.set_ratio_for(pane, ratio) {
                    return true;
                }
                *current = clamp_ratio(ratio);
                true
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabLayout {
    pub id: TabId,
    pub server: ServerId,
    pub root: LayoutNode,
    pub focused: TerminalId,
}

impl TabLayout {
    pub fn new(server: ServerId, pane: TerminalId) -> Self {
        Self {
            id: TabId::new(),
            server,
            root: LayoutNode::Leaf(pane),
            focused: pane,
        }
    }

    pub fn contains(&self, pane: TerminalId) -> bool {
        self.root.contains(pane)
    }

    pub fn panes(&self) -> Vec<TerminalId> {
        self.root.leaves()
    }

    pub fn split(&mut self, target: TerminalId, new_pane: TerminalId, direction: SplitDirection) -> bool {
        let split = self.root.split(target, new_pane, direction);
        if split {
            self.focused = new_pane;
        }
        split
    }

    /// Remove `pane`. Returns false when the tab is now empty.
    pub fn remove(&mut self, pane: TerminalId) -> bool {
        let panes = self.panes();
        let position = panes.iter().position(|p| *p == pane);
        let root = std::mem::replace(&mut self.root, LayoutNode::Leaf(pane));
        match root.remove(pane) {
            Some(root) => {
                self.root = root;
                if self.focused == pane {
                    let remaining = self.panes();
                    let index = position.unwrap_or(0).min(remaining.len().saturating_sub(1));
                    if let Some(next) = remaining.get(index) {
                        self.focused = *next;
                    }
                }
                true
            }
            None => false,
        }
    }
}

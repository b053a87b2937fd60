//! Outline tree types shared across the pipeline.

use serde::{Deserialize, Serialize};

/// A titled section of the document, owning its subsections in document order.
///
/// Page ranges are optional until the boundary validator has run; afterwards
/// every positioned node satisfies `1 <= page_start <= page_end <= total_pages`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Section {
    pub id: String,
    pub title: String,
    pub level: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_start: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_end: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub children: Vec<Section>,
}

impl Section {
    pub fn new(id: impl Into<String>, title: impl Into<String>, level: u32) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            level,
            page_start: None,
            page_end: None,
            summary: None,
            children: Vec::new(),
        }
    }

    /// Pre-order traversal over the subtree rooted at `self`.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Section)) {
        f(self);
        for child in &self.children {
            child.walk(f);
        }
    }

    /// Pre-order traversal with mutable access.
    pub fn walk_mut(&mut self, f: &mut impl FnMut(&mut Section)) {
        f(self);
        for child in &mut self.children {
            child.walk_mut(f);
        }
    }

    /// Find a node by id anywhere in the subtree.
    pub fn find(&self, id: &str) -> Option<&Section> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }

    /// Find a node by id anywhere in the subtree, mutably.
    pub fn find_mut(&mut self, id: &str) -> Option<&mut Section> {
        if self.id == id {
            return Some(self);
        }
        self.children
            .iter_mut()
            .find_map(|child| child.find_mut(id))
    }

    /// Number of nodes in the subtree, including `self`.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(Section::count).sum::<usize>()
    }

    /// All descendants of `self` in document (pre-order) order.
    pub fn descendants(&self) -> Vec<&Section> {
        let mut out = Vec::new();
        for child in &self.children {
            child.walk(&mut |node| out.push(node));
        }
        out
    }
}

/// Deterministic id allocator for sections (`s1`, `s2`, ...).
///
/// Creation order is the only source of ids, so a rerun over identical oracle
/// output assigns identical ids.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> String {
        self.next += 1;
        format!("s{}", self.next)
    }
}

/// Create an empty root covering `1..=total_pages`.
pub fn document_root(ids: &mut IdAllocator, title: impl Into<String>, total_pages: u32) -> Section {
    let mut root = Section::new(ids.next_id(), title, 0);
    root.page_start = Some(1);
    root.page_end = Some(total_pages);
    root
}

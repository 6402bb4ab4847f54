//! Writable tree
//!
//! The export hierarchy is an arena of nodes addressed by `NodeId`. A node's
//! parent is only an id used to rebuild its path, so the arena owns every node
//! and there are no reference cycles.
//!
//! A tree is used in two phases. `prepare` walks the tree with the current
//! index path, expands index directories into one subdirectory per index
//! value and renders every file. `write` then materializes prepared nodes under
//! the root location. Writing a node that is unprepared or not attached to a
//! root fails with `StructuralIntegrityError`.

mod file;
mod index;

pub use file::{FileSource, RenderContext, StaticFile};
pub use index::{IndexFn, IndexFormatter, IndexStack, IndexValue, Template};

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;

use crate::error::{CoreError, Result};
use index::IndexSpec;

/// Name of the manifest every directory writes
pub const MANIFEST_NAME: &str = "index";

/// Handle to a node in a `Tree`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

struct DirectoryNode {
    children: Vec<NodeId>,
    index: Option<IndexSpec>,
    manifest: bool,
}

struct FileNode {
    source: Box<dyn FileSource>,
    bytes: Option<Vec<u8>>,
}

enum NodeKind {
    Directory(DirectoryNode),
    File(FileNode),
}

struct Node {
    name: String,
    parent: Option<NodeId>,
    location: Option<PathBuf>,
    prepared: bool,
    kind: NodeKind,
}

/// Arena of directory and file nodes
#[derive(Default)]
pub struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, name: String, kind: NodeKind) -> NodeId {
        self.nodes.push(Node {
            name,
            parent: None,
            location: None,
            prepared: false,
            kind,
        });
        NodeId(self.nodes.len() - 1)
    }

    /// Directory materialized at `location`
    pub fn root(&mut self, location: impl Into<PathBuf>) -> NodeId {
        let location = location.into();
        let name = location
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let id = self.directory(name);
        self.nodes[id.0].location = Some(location);
        id
    }

    pub fn directory(&mut self, name: impl Into<String>) -> NodeId {
        self.push(
            name.into(),
            NodeKind::Directory(DirectoryNode {
                children: Vec::new(),
                index: None,
                manifest: true,
            }),
        )
    }

    /// Directory holding one generated subdirectory per value of `index_fn`
    pub fn index_directory<I, F>(&mut self, name: impl Into<String>, index_fn: I, formatter: F) -> NodeId
    where
        I: Fn(&IndexStack) -> Result<Vec<IndexValue>> + Send + Sync + 'static,
        F: Fn(&IndexValue) -> String + Send + Sync + 'static,
    {
        self.push(
            name.into(),
            NodeKind::Directory(DirectoryNode {
                children: Vec::new(),
                index: Some(IndexSpec::new(Arc::new(index_fn), Arc::new(formatter))),
                manifest: true,
            }),
        )
    }

    pub fn file(&mut self, name: impl Into<String>, source: impl FileSource + 'static) -> NodeId {
        self.push(
            name.into(),
            NodeKind::File(FileNode {
                source: Box::new(source),
                bytes: None,
            }),
        )
    }

    fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| CoreError::StructuralIntegrityError(format!("Unknown node {:?}", id)))
    }

    fn directory_mut(&mut self, id: NodeId) -> Result<&mut DirectoryNode> {
        let node = self
            .nodes
            .get_mut(id.0)
            .ok_or_else(|| CoreError::StructuralIntegrityError(format!("Unknown node {:?}", id)))?;
        match &mut node.kind {
            NodeKind::Directory(dir) => Ok(dir),
            NodeKind::File(_) => Err(CoreError::StructuralIntegrityError(format!(
                "'{}' is a file, not a directory",
                node.name
            ))),
        }
    }

    pub fn name(&self, id: NodeId) -> &str {
        self.nodes.get(id.0).map(|n| n.name.as_str()).unwrap_or_default()
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id.0).and_then(|n| n.parent)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        match self.nodes.get(id.0).map(|n| &n.kind) {
            Some(NodeKind::Directory(dir)) => &dir.children,
            _ => &[],
        }
    }

    pub fn child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.children(parent)
            .iter()
            .copied()
            .find(|c| self.name(*c) == name)
    }

    pub fn is_prepared(&self, id: NodeId) -> bool {
        self.nodes.get(id.0).map(|n| n.prepared).unwrap_or(false)
    }

    /// Rendered bytes of a prepared file
    pub fn bytes(&self, id: NodeId) -> Option<&[u8]> {
        match self.nodes.get(id.0).map(|n| &n.kind) {
            Some(NodeKind::File(file)) => file.bytes.as_deref(),
            _ => None,
        }
    }

    /// Attach `child` below `parent`
    pub fn add_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        let child_node = self.node(child)?;
        validate_name(&child_node.name)?;
        if child_node.parent.is_some() {
            return Err(CoreError::StructuralIntegrityError(format!(
                "'{}' already has a parent",
                child_node.name
            )));
        }
        if child_node.location.is_some() {
            return Err(CoreError::StructuralIntegrityError(format!(
                "Root '{}' cannot become a child",
                child_node.name
            )));
        }
        let mut ancestor = Some(parent);
        while let Some(id) = ancestor {
            if id == child {
                return Err(CoreError::StructuralIntegrityError(format!(
                    "Attaching '{}' would create a cycle",
                    self.name(child)
                )));
            }
            ancestor = self.parent(id);
        }
        let name = self.name(child).to_string();
        if self.child(parent, &name).is_some() {
            return Err(CoreError::StructuralIntegrityError(format!(
                "'{}' already contains '{}'",
                self.name(parent),
                name
            )));
        }
        self.directory_mut(parent)?.children.push(child);
        self.nodes[child.0].parent = Some(parent);
        Ok(())
    }

    pub fn set_parent(&mut self, child: NodeId, parent: NodeId) -> Result<()> {
        self.add_child(parent, child)
    }

    /// Register a template applied to every generated subdirectory of an index directory
    pub fn add_to_all<T>(&mut self, index_directory: NodeId, template: T) -> Result<()>
    where
        T: Fn(&mut Tree, NodeId, &IndexStack) -> Result<()> + Send + Sync + 'static,
    {
        let name = self.name(index_directory).to_string();
        match self.directory_mut(index_directory)?.index.as_mut() {
            Some(spec) => {
                spec.templates.push(Arc::new(template));
                Ok(())
            }
            None => Err(CoreError::StructuralIntegrityError(format!(
                "'{}' is not an index directory",
                name
            ))),
        }
    }

    /// Build the generated subdirectories of an index directory on scoped threads
    pub fn set_parallel(&mut self, index_directory: NodeId, parallel: bool) -> Result<()> {
        if let Some(spec) = self.directory_mut(index_directory)?.index.as_mut() {
            spec.parallel = parallel;
        }
        Ok(())
    }

    pub fn set_manifest(&mut self, directory: NodeId, manifest: bool) -> Result<()> {
        self.directory_mut(directory)?.manifest = manifest;
        Ok(())
    }

    /// Prepare `id` and everything below it with the index path `stack`.
    ///
    /// Index values are sorted and deduplicated before expansion. Generated
    /// subdirectories come first in index order, static children follow
    /// sorted by name. Files with sibling dependencies are rendered last.
    /// Preparing an already prepared node is a no-op.
    pub fn prepare(&mut self, id: NodeId, stack: &IndexStack) -> Result<()> {
        if self.node(id)?.prepared {
            return Ok(());
        }

        if let NodeKind::File(file) = &self.node(id)?.kind {
            let ctx = RenderContext {
                tree: self,
                node: id,
                indices: stack,
            };
            let bytes = file.source.render(&ctx)?;
            if let NodeKind::File(file) = &mut self.nodes[id.0].kind {
                file.bytes = Some(bytes);
            }
            self.nodes[id.0].prepared = true;
            return Ok(());
        }

        let spec = self.directory_mut(id)?.index.clone();
        let mut static_children = self.children(id).to_vec();
        static_children.sort_by(|a, b| self.name(*a).cmp(self.name(*b)));

        let generated = match spec {
            Some(spec) => self.expand_index(id, &spec, stack)?,
            None => Vec::new(),
        };

        let mut order = static_children.clone();
        order.sort_by_key(|c| !self.dependencies(*c).is_empty());
        for child in order {
            self.prepare(child, stack)?;
        }

        let dir = self.directory_mut(id)?;
        dir.children = generated;
        dir.children.extend(static_children);
        self.nodes[id.0].prepared = true;
        Ok(())
    }

    fn dependencies(&self, id: NodeId) -> Vec<String> {
        match self.nodes.get(id.0).map(|n| &n.kind) {
            Some(NodeKind::File(file)) => file.source.dependencies(),
            _ => Vec::new(),
        }
    }

    fn expand_index(&mut self, id: NodeId, spec: &IndexSpec, stack: &IndexStack) -> Result<Vec<NodeId>> {
        let mut values = (spec.index_fn)(stack)?;
        values.sort();
        values.dedup();
        debug!("Expanding '{}' into {} partitions", self.name(id), values.len());

        let build = |value: IndexValue| -> Result<(Tree, NodeId)> {
            let mut fragment = Tree::new();
            let dir = fragment.directory((spec.formatter)(&value));
            let pushed = stack.push(value);
            for template in &spec.templates {
                template(&mut fragment, dir, &pushed)?;
            }
            fragment.prepare(dir, &pushed)?;
            Ok((fragment, dir))
        };

        let fragments: Vec<Result<(Tree, NodeId)>> = if spec.parallel && values.len() > 1 {
            let build = &build;
            std::thread::scope(|scope| {
                let handles: Vec<_> = values
                    .into_iter()
                    .map(|value| scope.spawn(move || build(value)))
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| {
                        handle.join().unwrap_or_else(|_| {
                            Err(CoreError::StructuralIntegrityError(
                                "Subtree builder panicked".to_string(),
                            ))
                        })
                    })
                    .collect()
            })
        } else {
            values.into_iter().map(build).collect()
        };

        let mut generated = Vec::with_capacity(fragments.len());
        for fragment in fragments {
            let (fragment, top) = fragment?;
            let grafted = self.graft(fragment, top);
            self.add_child(id, grafted)?;
            generated.push(grafted);
        }
        Ok(generated)
    }

    /// Move every node of `fragment` into this arena, returning the new id of `top`
    fn graft(&mut self, fragment: Tree, top: NodeId) -> NodeId {
        let offset = self.nodes.len();
        let shift = |id: NodeId| NodeId(id.0 + offset);
        for mut node in fragment.nodes {
            node.parent = node.parent.map(shift);
            if let NodeKind::Directory(dir) = &mut node.kind {
                for child in dir.children.iter_mut() {
                    *child = shift(*child);
                }
            }
            self.nodes.push(node);
        }
        shift(top)
    }

    /// Path of `id` relative to its root
    pub fn relative_path(&self, id: NodeId) -> Result<PathBuf> {
        let mut segments = Vec::new();
        let mut current = id;
        loop {
            let node = self.node(current)?;
            if node.location.is_some() {
                break;
            }
            let parent = node.parent.ok_or_else(|| {
                CoreError::StructuralIntegrityError(format!(
                    "'{}' is not attached to a root",
                    node.name
                ))
            })?;
            if !self.children(parent).contains(&current) {
                return Err(CoreError::StructuralIntegrityError(format!(
                    "'{}' is detached from its parent '{}'",
                    node.name,
                    self.name(parent)
                )));
            }
            segments.push(node.name.as_str());
            current = parent;
        }
        Ok(segments.iter().rev().collect())
    }

    /// Filesystem location `write` materializes `id` at
    pub fn location(&self, id: NodeId) -> Result<PathBuf> {
        let relative = self.relative_path(id)?;
        let mut root = id;
        while let Some(parent) = self.parent(root) {
            root = parent;
        }
        let base = self.node(root)?.location.clone().ok_or_else(|| {
            CoreError::StructuralIntegrityError(format!("'{}' has no root location", self.name(id)))
        })?;
        Ok(base.join(relative))
    }

    fn manifest_bytes(&self, id: NodeId) -> Result<Option<Vec<u8>>> {
        let NodeKind::Directory(dir) = &self.node(id)?.kind else {
            return Ok(None);
        };
        if !dir.manifest {
            return Ok(None);
        }
        let names: Vec<&str> = dir.children.iter().map(|c| self.name(*c)).collect();
        if names.contains(&MANIFEST_NAME) {
            return Err(CoreError::StructuralIntegrityError(format!(
                "'{}' has a child named '{}'",
                self.name(id),
                MANIFEST_NAME
            )));
        }
        Ok(Some(serde_json::to_vec(&names)?))
    }

    fn check_prepared(&self, id: NodeId) -> Result<&Node> {
        let node = self.node(id)?;
        if !node.prepared {
            return Err(CoreError::StructuralIntegrityError(format!(
                "'{}' has not been prepared",
                node.name
            )));
        }
        Ok(node)
    }

    /// Materialize a prepared node and everything below it
    pub fn write(&self, id: NodeId) -> Result<()> {
        let node = self.check_prepared(id)?;
        let path = self.location(id)?;
        match &node.kind {
            NodeKind::File(file) => {
                let bytes = file.bytes.as_deref().unwrap_or_default();
                fs::write(&path, bytes)?;
            }
            NodeKind::Directory(dir) => {
                fs::create_dir_all(&path)?;
                for child in &dir.children {
                    self.write(*child)?;
                }
                if let Some(manifest) = self.manifest_bytes(id)? {
                    fs::write(path.join(MANIFEST_NAME), manifest)?;
                }
            }
        }
        Ok(())
    }

    /// Visit every file `write` would produce below `id`, manifests included,
    /// in write order with paths relative to `id`
    pub fn visit_files<F>(&self, id: NodeId, visitor: &mut F) -> Result<()>
    where
        F: FnMut(&Path, &[u8]) -> Result<()>,
    {
        self.visit_from(id, PathBuf::new(), visitor)
    }

    fn visit_from<F>(&self, id: NodeId, path: PathBuf, visitor: &mut F) -> Result<()>
    where
        F: FnMut(&Path, &[u8]) -> Result<()>,
    {
        let node = self.check_prepared(id)?;
        match &node.kind {
            NodeKind::File(file) => {
                let path = if path.as_os_str().is_empty() {
                    PathBuf::from(&node.name)
                } else {
                    path
                };
                visitor(&path, file.bytes.as_deref().unwrap_or_default())
            }
            NodeKind::Directory(dir) => {
                for child in &dir.children {
                    self.visit_from(*child, path.join(self.name(*child)), visitor)?;
                }
                if let Some(manifest) = self.manifest_bytes(id)? {
                    visitor(&path.join(MANIFEST_NAME), &manifest)?;
                }
                Ok(())
            }
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(|c| c == '/' || c == '\\') {
        return Err(CoreError::ValidationError(format!(
            "Invalid node name: {:?}",
            name
        )));
    }
    Ok(())
}

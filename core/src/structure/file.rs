//! File leaves of the writable tree

use super::{IndexStack, NodeId, Tree};
use crate::error::{CoreError, Result};

/// Produces the bytes of a file node during `prepare`
pub trait FileSource: Send + Sync {
    fn render(&self, ctx: &RenderContext<'_>) -> Result<Vec<u8>>;

    /// Sibling files that must be prepared before this one
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }
}

impl<F> FileSource for F
where
    F: Fn(&RenderContext<'_>) -> Result<Vec<u8>> + Send + Sync,
{
    fn render(&self, ctx: &RenderContext<'_>) -> Result<Vec<u8>> {
        self(ctx)
    }
}

/// Fixed content
#[derive(Debug, Clone)]
pub struct StaticFile(pub Vec<u8>);

impl FileSource for StaticFile {
    fn render(&self, _ctx: &RenderContext<'_>) -> Result<Vec<u8>> {
        Ok(self.0.clone())
    }
}

/// What a file source can see while it renders
pub struct RenderContext<'a> {
    pub(super) tree: &'a Tree,
    pub(super) node: NodeId,
    pub(super) indices: &'a IndexStack,
}

impl<'a> RenderContext<'a> {
    /// Index path of the directory holding this file
    pub fn indices(&self) -> &IndexStack {
        self.indices
    }

    pub fn name(&self) -> &str {
        self.tree.name(self.node)
    }

    /// Bytes of an already prepared sibling file
    pub fn sibling_bytes(&self, name: &str) -> Result<&'a [u8]> {
        let parent = self.tree.parent(self.node).ok_or_else(|| {
            CoreError::StructuralIntegrityError(format!(
                "File '{}' has no parent to look up '{}'",
                self.name(),
                name
            ))
        })?;
        let sibling = self.tree.child(parent, name).ok_or_else(|| {
            CoreError::StructuralIntegrityError(format!("No sibling named '{}'", name))
        })?;
        self.tree.bytes(sibling).ok_or_else(|| {
            CoreError::StructuralIntegrityError(format!("Sibling '{}' is not prepared", name))
        })
    }
}

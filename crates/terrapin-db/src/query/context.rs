//! Join-path stack used while resolving relation paths.
//!
//! Resolving `tournament__events__name` walks from the base model into
//! related models. Each hop pushes a [`Frame`] (model plus the table alias it
//! was joined under) and pops it on the way back, so every resolver sees the
//! model it is currently positioned on through [`QueryContext::top`] and the
//! enclosing query through [`QueryContext::parent`]. The root frame can never
//! be popped.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::model::ModelMeta;
use crate::query::compiler::TableRef;

/// A junction table already joined to a frame's row.
#[derive(Debug, Clone, PartialEq)]
pub struct Through {
    pub table: TableRef,
    /// Junction column the frame's primary key is joined on.
    pub key: String,
}

/// One level of the join path.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub model: Arc<ModelMeta>,
    pub table: TableRef,
    /// Junction tables already joined to this frame, keyed by junction table
    /// name. A many-to-many hop over one of them reuses the joined row
    /// instead of joining the junction again.
    pub through_tables: BTreeMap<String, Through>,
}

impl Frame {
    pub fn new(model: Arc<ModelMeta>, table: TableRef) -> Self {
        Self {
            model,
            table,
            through_tables: BTreeMap::new(),
        }
    }

    /// A frame for the model's own table, unaliased.
    pub fn root(model: Arc<ModelMeta>) -> Self {
        let table = TableRef::new(model.table.clone());
        Self::new(model, table)
    }

    #[must_use]
    pub fn with_through(mut self, table: TableRef, key: impl Into<String>) -> Self {
        self.through_tables.insert(
            table.name.clone(),
            Through {
                table,
                key: key.into(),
            },
        );
        self
    }

    /// The junction `through` if it is joined to this frame on `key`.
    pub fn joined_through(&self, through: &str, key: &str) -> Option<&TableRef> {
        self.through_tables
            .get(through)
            .filter(|t| t.key == key)
            .map(|t| &t.table)
    }
}

/// Stack of frames; the bottom frame is the outermost query's base table.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryContext {
    root: Frame,
    stack: Vec<Frame>,
}

impl QueryContext {
    pub fn new(root: Frame) -> Self {
        Self {
            root,
            stack: Vec::new(),
        }
    }

    pub fn push(&mut self, frame: Frame) {
        self.stack.push(frame);
    }

    /// Pops the top frame. The root frame stays in place.
    pub fn pop(&mut self) -> Option<Frame> {
        self.stack.pop()
    }

    /// The frame resolution is currently positioned on.
    pub fn top(&self) -> &Frame {
        self.stack.last().unwrap_or(&self.root)
    }

    /// The frame below the top, if any.
    pub fn parent(&self) -> Option<&Frame> {
        match self.stack.len() {
            0 => None,
            1 => Some(&self.root),
            n => self.stack.get(n - 2),
        }
    }

    pub fn depth(&self) -> usize {
        self.stack.len() + 1
    }

    /// Every frame from the root upwards.
    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        std::iter::once(&self.root).chain(self.stack.iter())
    }

    /// Whether any frame already uses `ident` as its table identifier.
    pub fn uses_ident(&self, ident: &str) -> bool {
        self.frames().any(|f| f.table.ident() == ident)
    }

    /// Runs `f` with `frame` pushed, popping it afterwards whatever `f`
    /// returns.
    pub fn scoped<R>(&mut self, frame: Frame, f: impl FnOnce(&mut Self) -> R) -> R {
        let depth = self.depth();
        self.push(frame);
        let out = f(self);
        self.stack.truncate(depth - 1);
        out
    }

    /// Runs `f` positioned on the parent frame, restoring the top afterwards.
    /// Returns `None` at the root.
    pub fn with_parent<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> Option<R> {
        let top = self.stack.pop()?;
        let out = f(self);
        self.stack.push(top);
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{FieldDef, FieldType};
    use crate::model::ModelDef;
    use crate::registry::Registry;

    fn metas() -> (Arc<ModelMeta>, Arc<ModelMeta>) {
        let reg = Registry::builder()
            .register(
                ModelDef::new("Tournament")
                    .field(FieldDef::new("id", FieldType::IntField).primary_key()),
            )
            .register(
                ModelDef::new("Event")
                    .field(FieldDef::new("id", FieldType::IntField).primary_key())
                    .field(FieldDef::foreign_key("tournament", "Tournament")),
            )
            .build()
            .unwrap();
        (reg.get("Tournament").unwrap(), reg.get("Event").unwrap())
    }

    #[test]
    fn test_push_pop_top_parent() {
        let (t, e) = metas();
        let mut ctx = QueryContext::new(Frame::root(t.clone()));
        assert_eq!(ctx.depth(), 1);
        assert!(ctx.parent().is_none());
        assert_eq!(ctx.top().model.name, "Tournament");

        ctx.push(Frame::new(e, TableRef::aliased("event", "tournament__events")));
        assert_eq!(ctx.depth(), 2);
        assert_eq!(ctx.top().table.ident(), "tournament__events");
        assert_eq!(ctx.parent().unwrap().model.name, "Tournament");

        assert!(ctx.pop().is_some());
        assert!(ctx.pop().is_none());
        assert_eq!(ctx.depth(), 1);
    }

    #[test]
    fn test_scoped_restores_depth_on_error() {
        let (t, e) = metas();
        let mut ctx = QueryContext::new(Frame::root(t));
        let result: Result<(), &str> = ctx.scoped(Frame::root(e), |inner| {
            assert_eq!(inner.depth(), 2);
            inner.push(Frame::root(inner.top().model.clone()));
            Err("boom")
        });
        assert!(result.is_err());
        assert_eq!(ctx.depth(), 1);
    }

    #[test]
    fn test_with_parent() {
        let (t, e) = metas();
        let mut ctx = QueryContext::new(Frame::root(t));
        assert!(ctx.with_parent(|_| ()).is_none());
        ctx.push(Frame::root(e));
        let name = ctx.with_parent(|c| c.top().model.name.clone()).unwrap();
        assert_eq!(name, "Tournament");
        assert_eq!(ctx.top().model.name, "Event");
    }

    #[test]
    fn test_uses_ident_and_through() {
        let (t, e) = metas();
        let mut ctx = QueryContext::new(Frame::root(t));
        let frame = Frame::new(e, TableRef::aliased("event", "x"))
            .with_through(TableRef::new("event_team"), "event_id");
        ctx.push(frame);
        assert!(ctx.uses_ident("tournament"));
        assert!(ctx.uses_ident("x"));
        assert!(!ctx.uses_ident("event"));
        let top = ctx.top();
        assert_eq!(
            top.joined_through("event_team", "event_id").map(TableRef::ident),
            Some("event_team")
        );
        assert!(top.joined_through("event_team", "team_id").is_none());
        assert!(top.joined_through("other", "event_id").is_none());
    }
}

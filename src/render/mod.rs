//! Template resolution - views, escaping, and the `{t, h, p}` object.
//!
//! Components are plain functions returning a [`View`]. Resolution walks
//! the view, accumulating HTML into string segments. A dynamic part whose
//! evaluation suspends (returns `NotReady`) is captured as a *hole*: the
//! segment is closed, the thunk is kept for re-execution, and the
//! suspending promise is recorded. [`ssr`] re-runs holes against the
//! segments once their promises settle; still-suspended holes are
//! re-captured with their new promises.
//!
//! Invariants on [`SsrTemplate`]: `t.len() == h.len() + 1`; empty `h` and
//! `p` means the finished HTML is the concatenation of `t` (a single
//! segment in practice).

mod context;

pub use context::{
    current_render_context, reset_render_context, with_render_context, AssetKind,
    FragmentHandle, FragmentState, RenderContext, SerializedWrite,
};

use std::fmt;
use std::rc::Rc;

use crate::task::Promise;
use crate::types::{RenderError, RenderResult};

// =============================================================================
// View
// =============================================================================

/// A hole: a thunk captured from a suspended dynamic part, re-executed on
/// dependency resolution.
pub type Hole = Rc<dyn Fn() -> RenderResult<View>>;

/// What components return.
#[derive(Clone)]
pub enum View {
    /// Text content, HTML-escaped at resolve time.
    Text(String),
    /// Pre-rendered markup, inserted verbatim.
    Raw(String),
    /// A sequence of child views.
    List(Vec<View>),
    /// A dynamic part; may suspend with `NotReady`.
    Dyn(Hole),
}

impl View {
    pub fn text(s: impl Into<String>) -> View {
        View::Text(s.into())
    }

    pub fn raw(s: impl Into<String>) -> View {
        View::Raw(s.into())
    }

    /// An empty view.
    pub fn empty() -> View {
        View::Raw(String::new())
    }

    pub fn dynamic(f: impl Fn() -> RenderResult<View> + 'static) -> View {
        View::Dyn(Rc::new(f))
    }
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            View::Text(s) => write!(f, "Text({s:?})"),
            View::Raw(s) => write!(f, "Raw({s:?})"),
            View::List(children) => write!(f, "List({} children)", children.len()),
            View::Dyn(_) => write!(f, "Dyn(..)"),
        }
    }
}

impl From<&str> for View {
    fn from(s: &str) -> View {
        View::Text(s.to_string())
    }
}

impl From<String> for View {
    fn from(s: String) -> View {
        View::Text(s)
    }
}

impl From<Vec<View>> for View {
    fn from(children: Vec<View>) -> View {
        View::List(children)
    }
}

/// Build an element view: open tag with escaped attribute values, children,
/// close tag.
pub fn element(tag: &str, attrs: &[(&str, &str)], children: Vec<View>) -> View {
    let mut open = String::with_capacity(tag.len() + 2);
    open.push('<');
    open.push_str(tag);
    for (name, value) in attrs {
        open.push(' ');
        open.push_str(name);
        open.push_str("=\"");
        open.push_str(&escape(value, true));
        open.push('"');
    }
    open.push('>');

    let mut parts = Vec::with_capacity(children.len() + 2);
    parts.push(View::Raw(open));
    parts.extend(children);
    parts.push(View::Raw(format!("</{tag}>")));
    View::List(parts)
}

// =============================================================================
// Escaping
// =============================================================================

/// HTML-escape for text content, or for a double-quoted attribute value
/// when `attr` is set.
pub fn escape(value: &str, attr: bool) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if attr => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

// =============================================================================
// Template Object
// =============================================================================

/// The structured result of template resolution: string segments, hole
/// functions, and the promises of unresolved holes.
pub struct SsrTemplate {
    pub t: Vec<String>,
    pub h: Vec<Hole>,
    pub p: Vec<Promise>,
}

impl SsrTemplate {
    /// The finished HTML, if no holes remain.
    pub fn into_html(self) -> Option<String> {
        if self.h.is_empty() {
            Some(self.t.concat())
        } else {
            None
        }
    }

    pub fn has_holes(&self) -> bool {
        !self.h.is_empty()
    }
}

impl fmt::Debug for SsrTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SsrTemplate")
            .field("t", &self.t)
            .field("holes", &self.h.len())
            .field("pending", &self.p.len())
            .finish()
    }
}

struct TemplateBuilder {
    t: Vec<String>,
    current: String,
    h: Vec<Hole>,
    p: Vec<Promise>,
}

impl TemplateBuilder {
    fn new() -> Self {
        TemplateBuilder {
            t: Vec::new(),
            current: String::new(),
            h: Vec::new(),
            p: Vec::new(),
        }
    }

    fn push_view(&mut self, view: &View) -> RenderResult<()> {
        match view {
            View::Text(s) => self.current.push_str(&escape(s, false)),
            View::Raw(s) => self.current.push_str(s),
            View::List(children) => {
                for child in children {
                    self.push_view(child)?;
                }
            }
            View::Dyn(f) => self.push_hole(f)?,
        }
        Ok(())
    }

    fn push_hole(&mut self, f: &Hole) -> RenderResult<()> {
        match f() {
            Ok(view) => self.push_view(&view),
            Err(RenderError::NotReady(promise)) => {
                self.t.push(std::mem::take(&mut self.current));
                self.h.push(f.clone());
                self.p.push(promise);
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    fn finish(mut self) -> SsrTemplate {
        self.t.push(self.current);
        SsrTemplate {
            t: self.t,
            h: self.h,
            p: self.p,
        }
    }
}

/// Resolve a view into template form, capturing suspended dynamic parts as
/// holes. Non-suspension errors propagate.
pub fn resolve(view: &View) -> RenderResult<SsrTemplate> {
    let mut builder = TemplateBuilder::new();
    builder.push_view(view)?;
    Ok(builder.finish())
}

/// Re-interpolate segments and holes after (some) hole promises settled.
///
/// Holes that resolve stringify into the segments, including any nested
/// views they produce; a nested part that suspends becomes a new hole with
/// its new promise. Holes that still suspend are re-captured.
pub fn ssr(t: &[String], h: &[Hole]) -> RenderResult<SsrTemplate> {
    debug_assert_eq!(t.len(), h.len() + 1, "segment/hole alignment");
    let mut builder = TemplateBuilder::new();
    builder.current.push_str(&t[0]);
    for (i, hole) in h.iter().enumerate() {
        builder.push_hole(hole)?;
        builder.current.push_str(&t[i + 1]);
    }
    Ok(builder.finish())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Promise, PromiseResolver};
    use crate::types::Value;
    use std::cell::RefCell;

    #[test]
    fn test_escape_text_and_attr() {
        assert_eq!(escape("a < b & c", false), "a &lt; b &amp; c");
        assert_eq!(escape(r#"say "hi""#, false), r#"say "hi""#);
        assert_eq!(escape(r#"say "hi""#, true), "say &quot;hi&quot;");
    }

    #[test]
    fn test_resolve_plain_view() {
        let view = element("div", &[("class", "x")], vec![View::text("a < b")]);
        let tpl = resolve(&view).unwrap();
        assert!(!tpl.has_holes());
        assert_eq!(tpl.into_html().unwrap(), r#"<div class="x">a &lt; b</div>"#);
    }

    #[test]
    fn test_resolve_captures_hole() {
        let (promise, _resolver) = Promise::deferred();
        let view = View::List(vec![
            View::raw("<p>"),
            View::dynamic(move || Err(RenderError::NotReady(promise.clone()))),
            View::raw("</p>"),
        ]);
        let tpl = resolve(&view).unwrap();
        assert_eq!(tpl.t, vec!["<p>".to_string(), "</p>".to_string()]);
        assert_eq!(tpl.h.len(), 1);
        assert_eq!(tpl.p.len(), 1);
    }

    #[test]
    fn test_ssr_fills_resolved_holes() {
        // A hole that suspends until its cell carries a value.
        let cell: std::rc::Rc<RefCell<Option<Value>>> = std::rc::Rc::new(RefCell::new(None));
        let (promise, resolver): (Promise, PromiseResolver) = Promise::deferred();

        let cell2 = cell.clone();
        let view = View::List(vec![
            View::raw("<div>"),
            View::dynamic(move || match cell2.borrow().clone() {
                Some(v) => Ok(View::text(v.render_text())),
                None => Err(RenderError::NotReady(promise.clone())),
            }),
            View::raw("</div>"),
        ]);

        let tpl = resolve(&view).unwrap();
        assert!(tpl.has_holes());

        *cell.borrow_mut() = Some(Value::str("Hello World"));
        resolver.resolve(Value::str("Hello World"));

        let done = ssr(&tpl.t, &tpl.h).unwrap();
        assert_eq!(done.into_html().unwrap(), "<div>Hello World</div>");
    }

    #[test]
    fn test_ssr_recaptures_still_suspended_holes_with_new_promise() {
        let (first, _keep) = Promise::deferred();
        let (second, _keep2) = Promise::deferred();
        let stage = std::rc::Rc::new(RefCell::new(0));

        let stage2 = stage.clone();
        let view = View::dynamic(move || {
            let s = *stage2.borrow();
            if s == 0 {
                Err(RenderError::NotReady(first.clone()))
            } else {
                Err(RenderError::NotReady(second.clone()))
            }
        });

        let tpl = resolve(&view).unwrap();
        *stage.borrow_mut() = 1;
        let again = ssr(&tpl.t, &tpl.h).unwrap();
        assert_eq!(again.p.len(), 1);
        assert!(!again.p[0].ptr_eq(&tpl.p[0]), "re-capture carries the new promise");
    }

    #[test]
    fn test_segment_hole_alignment_invariant() {
        let (promise, _r) = Promise::deferred();
        let p2 = promise.clone();
        let view = View::List(vec![
            View::dynamic(move || Err(RenderError::NotReady(promise.clone()))),
            View::text("mid"),
            View::dynamic(move || Err(RenderError::NotReady(p2.clone()))),
        ]);
        let tpl = resolve(&view).unwrap();
        assert_eq!(tpl.t.len(), tpl.h.len() + 1);
    }

    #[test]
    fn test_non_suspension_error_propagates() {
        let view = View::dynamic(|| Err(RenderError::user("boom")));
        assert!(resolve(&view).is_err());
    }
}

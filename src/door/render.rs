//! # Rendering content into doors.
//!
//! [`Content`] writes itself into a [`Renderer`]. A nested [`Door`](super::Door)
//! does not write inline: it reserves a hole and renders asynchronously on its own
//! tracker lane, joined to the task that renders its parent. The parent assembles
//! its output only after every nested render has filled its hole.
//!
//! ```text
//! parent render task (t) ── writes "<ul>" ── hole(#9) ── "</ul>"
//!                              └─ R(t) + W(door 9 lane): renders "<d0-0r id=\"d00r/9\">..</d0-0r>"
//! parent submit (after t) ── assemble: "<ul><d0-0r id=\"d00r/9\">..</d0-0r></ul>"
//! ```

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::error::RenderError;
use crate::shredder::Thread;

use super::Scope;

/// Something that can be rendered into a door.
pub trait Content: Send + Sync + 'static {
    fn render(&self, r: &mut Renderer) -> Result<(), RenderError>;
}

impl Content for String {
    fn render(&self, r: &mut Renderer) -> Result<(), RenderError> {
        r.write_str(self);
        Ok(())
    }
}

impl Content for &'static str {
    fn render(&self, r: &mut Renderer) -> Result<(), RenderError> {
        r.write_str(self);
        Ok(())
    }
}

/// [`Content`] backed by a closure; see [`content_fn`].
pub struct FnContent<F>(F);

impl<F> Content for FnContent<F>
where
    F: Fn(&mut Renderer) -> Result<(), RenderError> + Send + Sync + 'static,
{
    fn render(&self, r: &mut Renderer) -> Result<(), RenderError> {
        (self.0)(r)
    }
}

/// Wraps a closure as [`Content`].
///
/// # Example
/// ```
/// use doorframe::{Door, content_fn};
///
/// let counter = Door::new();
/// let page = content_fn(move |r| {
///     r.write_str("<h1>Counter</h1>");
///     r.render(&counter)
/// });
/// # let _ = page;
/// ```
pub fn content_fn<F>(f: F) -> FnContent<F>
where
    F: Fn(&mut Renderer) -> Result<(), RenderError> + Send + Sync + 'static,
{
    FnContent(f)
}

/// Output slot of a nested render.
#[derive(Clone, Default)]
pub(crate) struct Hole {
    slot: Arc<Mutex<Option<Result<String, RenderError>>>>,
}

impl Hole {
    pub(crate) fn fill(&self, res: Result<String, RenderError>) {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(res);
    }

    fn take(&self) -> Option<Result<String, RenderError>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

enum Piece {
    Text(String),
    Hole(Hole),
}

/// Finished pieces of one render, assembled once nested renders are done.
pub(crate) struct Output(Vec<Piece>);

impl Output {
    /// Joins text and filled holes. A failed nested render fails the whole output;
    /// an unfilled hole (cancelled render) contributes nothing.
    pub(crate) fn assemble(self) -> Result<String, RenderError> {
        let mut out = String::new();
        for piece in self.0 {
            match piece {
                Piece::Text(s) => out.push_str(&s),
                Piece::Hole(hole) => match hole.take() {
                    Some(Ok(s)) => out.push_str(&s),
                    Some(Err(e)) => return Err(e),
                    None => {}
                },
            }
        }
        Ok(out)
    }
}

/// Sink content renders into.
pub struct Renderer {
    scope: Scope,
    thread: Thread,
    pieces: Vec<Piece>,
}

impl Renderer {
    pub(crate) fn new(scope: Scope, thread: Thread) -> Self {
        Self {
            scope,
            thread,
            pieces: Vec::new(),
        }
    }

    /// Scope of the door being rendered.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn write_str(&mut self, s: &str) {
        match self.pieces.last_mut() {
            Some(Piece::Text(text)) => text.push_str(s),
            _ => self.pieces.push(Piece::Text(s.to_string())),
        }
    }

    /// Renders `content` in place.
    pub fn render(&mut self, content: &dyn Content) -> Result<(), RenderError> {
        if self.scope.is_cancelled() {
            return Err(RenderError::Cancelled);
        }
        content.render(self)
    }

    /// Task thread nested renders join.
    pub(crate) fn thread(&self) -> &Thread {
        &self.thread
    }

    pub(crate) fn hole(&mut self) -> Hole {
        let hole = Hole::default();
        self.pieces.push(Piece::Hole(hole.clone()));
        hole
    }

    pub(crate) fn finish(self) -> Output {
        Output(self.pieces)
    }
}

impl fmt::Write for Renderer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        Renderer::write_str(self, s);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_holes() {
        let a = Hole::default();
        let b = Hole::default();
        let out = Output(vec![
            Piece::Text("<ul>".into()),
            Piece::Hole(a.clone()),
            Piece::Hole(b),
            Piece::Text("</ul>".into()),
        ]);
        a.fill(Ok("<li>1</li>".into()));
        assert_eq!(out.assemble().unwrap(), "<ul><li>1</li></ul>");

        let c = Hole::default();
        c.fill(Err(RenderError::Content {
            error: "bad".into(),
        }));
        let out = Output(vec![Piece::Text("x".into()), Piece::Hole(c)]);
        assert!(matches!(out.assemble(), Err(RenderError::Content { .. })));
    }
}

//! Causal span trees and their summaries
//!
//! Once the connector has explained every event, this module turns the
//! explanations into something reportable: a [`Span`] tree per causal root
//! ("this round trip caused this dial, which caused this lookup"), each span
//! carrying per-reason schedules of when its goroutine ran, assisted, or
//! waited; and a [`TreeSummary`] that accounts the tree's wall-clock time to
//! reasons under a fixed precedence.

mod extract;
mod span;
mod summarize;

pub use extract::extract_spans;
pub use span::{running, ClusterError, Ranges, Span, TreeSummary};
pub use summarize::summarize;

/// Preorder visit over a span tree.
pub fn visit(span: &Span, f: &mut impl FnMut(&Span)) {
    f(span);
    for child in &span.caused {
        visit(child, f);
    }
}

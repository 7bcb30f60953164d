//! The content graph: a [`Show`] lazily enumerates its [`Episode`]s, an episode
//! turns its embed links into [`Stream`] candidates, a stream validates itself.

pub mod episode;
pub mod show;
pub mod stream;

pub use episode::Episode;
pub use show::{Show, make_uid};
pub use stream::Stream;

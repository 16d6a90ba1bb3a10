#![forbid(unsafe_code)]

//! Virtual nodes, diffing and live-tree reconciliation.
//!
//! A view is a [`Node`] tree. Each render produces a fresh tree; [`diff`]
//! compares it with the previous one and yields [`Patch`]es addressed by
//! pre-order index, and [`LiveTree::apply_patches`] binds those patches to
//! host nodes and applies them to a [`Document`]. Host events flow the
//! other way through [`LiveTree::dispatch`], which decodes them with the
//! handlers installed on the tree and maps the results through taggers.
//!
//! # Quick Start
//!
//! ```
//! use vela_vdom::{LiveTree, MemoryDocument, diff, html};
//!
//! let mut doc = MemoryDocument::new();
//! let container = doc.create_root("body");
//!
//! let old = html::div::<()>(vec![], vec![html::text("a")]).into_node();
//! let new = html::div::<()>(vec![], vec![html::text("b")]).into_node();
//!
//! let mut live = LiveTree::mount(doc, container, &old).unwrap();
//! let mut patches = diff(&old, &new);
//! live.apply_patches(&old, &mut patches);
//! assert_eq!(live.document().markup(live.root()), "<div>b</div>");
//! ```

pub mod diff;
pub mod document;
pub mod html;
pub mod live;
pub mod node;
pub mod patch;

pub use diff::{DUPLICATE_KEY_SUFFIX, diff, diff_facts};
pub use document::{Document, ListenerOptions, MemoryDocument, MutationStats, NodeId, Snapshot};
pub use html::{Attribute, Html};
pub use live::{DispatchError, Dispatched, EventNode, LiveTree, MountError, PatchReport};
pub use node::{CustomEvent, Fact, Facts, Handler, HandlerKind, Message, Node};
pub use patch::{Patch, PatchKind};

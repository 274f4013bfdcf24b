pub mod cell;
pub mod cell_id;
pub mod dep_graph;
pub mod document;
pub mod events;
pub mod formula;
pub mod recalc;

pub use cell::{Cell, CellContent, CellKind};
pub use cell_id::{Coord, Extent};
pub use dep_graph::DepGraph;
pub use document::{CellRecord, Commit, Document, DocumentError, DocumentRecord};
pub use events::{CellUpdate, ChangeSet, DocumentSnapshot};
pub use formula::{ErrorKind, Value};
pub use recalc::{CycleReport, RecalcReport, RecalcTrigger};

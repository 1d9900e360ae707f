//! flowgrid-autoscale — backlog-driven replica scaling.
//!
//! Reads the aggregate `pending` backlog the sidecars merged into a step's
//! status and turns it into a replica count. A step scaled to zero is
//! periodically "peeked" at with a single replica so its backlog can be
//! sampled again, and a scale window stops the count from flapping.
//!
//! # Scaling Algorithm
//!
//! ```text
//! if ratio undefined:
//!     desired = min
//! else:
//!     desired = clamp(ceil(pending / ratio), min, max)   // max may be unbounded
//!     if desired == 0 and min == 0 and current == 0 and peek delay elapsed:
//!         desired = 1                                    // peek
//!
//! if desired != current and last scale < 60s ago:
//!     hold at current
//! ```

pub mod scaler;

pub use scaler::{Autoscaler, ScaleDecision, SCALE_WINDOW, calculate};

// SPDX-License-Identifier: CEPL-1.0
use std::sync::mpsc::{self, Receiver, Sender};

use crate::RenderSize;

/// Notifications from the window collaborator, drained once per frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderEvent {
    Resized(RenderSize),
    /// The surface must be rebuilt even though its size did not change.
    SurfaceLost,
}

pub fn render_events() -> (Sender<RenderEvent>, Receiver<RenderEvent>) {
    mpsc::channel()
}

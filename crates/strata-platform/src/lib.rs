// SPDX-License-Identifier: CEPL-1.0
//! Windowing glue: re-exports winit and maps keys to camera moves.

pub use winit;

use anyhow::{Context, Result};
use tracing::info;
use winit::dpi::LogicalSize;
use winit::event::{ElementState, KeyEvent};
use winit::event_loop::ActiveEventLoop;
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowAttributes};

pub const DEFAULT_TITLE: &str = "strata";

pub fn window_attributes(title: &str, width: u32, height: u32) -> WindowAttributes {
    WindowAttributes::default()
        .with_title(title)
        .with_inner_size(LogicalSize::new(width, height))
}

pub fn create_window(
    event_loop: &ActiveEventLoop,
    title: &str,
    width: u32,
    height: u32,
) -> Result<Window> {
    let window = event_loop
        .create_window(window_attributes(title, width, height))
        .context("create_window")?;
    let size = window.inner_size();
    info!(
        "window '{}' created ({}x{} physical, scale {:.2})",
        title,
        size.width,
        size.height,
        window.scale_factor()
    );
    Ok(window)
}

/// Camera moves the application knows how to apply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CameraAction {
    /// Tile steps along world x and z.
    Pan { dx: i32, dz: i32 },
    ZoomIn,
    ZoomOut,
}

pub fn camera_action(key: &Key) -> Option<CameraAction> {
    match key {
        Key::Named(NamedKey::ArrowLeft) => Some(CameraAction::Pan { dx: -1, dz: 0 }),
        Key::Named(NamedKey::ArrowRight) => Some(CameraAction::Pan { dx: 1, dz: 0 }),
        Key::Named(NamedKey::ArrowUp) => Some(CameraAction::Pan { dx: 0, dz: -1 }),
        Key::Named(NamedKey::ArrowDown) => Some(CameraAction::Pan { dx: 0, dz: 1 }),
        Key::Character(c) => match c.as_str() {
            "a" | "A" => Some(CameraAction::Pan { dx: -1, dz: 0 }),
            "d" | "D" => Some(CameraAction::Pan { dx: 1, dz: 0 }),
            "w" | "W" => Some(CameraAction::Pan { dx: 0, dz: -1 }),
            "s" | "S" => Some(CameraAction::Pan { dx: 0, dz: 1 }),
            "+" | "=" => Some(CameraAction::ZoomIn),
            "-" | "_" => Some(CameraAction::ZoomOut),
            _ => None,
        },
        _ => None,
    }
}

/// Presses and auto-repeats move the camera; releases do nothing.
pub fn camera_action_for(event: &KeyEvent) -> Option<CameraAction> {
    if event.state != ElementState::Pressed {
        return None;
    }
    camera_action(&event.logical_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arrows_pan() {
        assert_eq!(
            camera_action(&Key::Named(NamedKey::ArrowLeft)),
            Some(CameraAction::Pan { dx: -1, dz: 0 })
        );
        assert_eq!(
            camera_action(&Key::Named(NamedKey::ArrowDown)),
            Some(CameraAction::Pan { dx: 0, dz: 1 })
        );
    }

    #[test]
    fn wasd_matches_arrows() {
        for (letter, arrow) in [
            ("w", NamedKey::ArrowUp),
            ("a", NamedKey::ArrowLeft),
            ("s", NamedKey::ArrowDown),
            ("d", NamedKey::ArrowRight),
        ] {
            assert_eq!(
                camera_action(&Key::Character(letter.into())),
                camera_action(&Key::Named(arrow)),
                "{letter}"
            );
        }
    }

    #[test]
    fn plus_and_minus_zoom() {
        assert_eq!(
            camera_action(&Key::Character("+".into())),
            Some(CameraAction::ZoomIn)
        );
        assert_eq!(
            camera_action(&Key::Character("=".into())),
            Some(CameraAction::ZoomIn)
        );
        assert_eq!(
            camera_action(&Key::Character("-".into())),
            Some(CameraAction::ZoomOut)
        );
    }

    #[test]
    fn other_keys_are_ignored() {
        assert_eq!(camera_action(&Key::Character("q".into())), None);
        assert_eq!(camera_action(&Key::Named(NamedKey::Escape)), None);
    }
}

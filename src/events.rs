//! Event dispatch for the window manager.
//!
//! One event is consumed and fully handled before the next is read. The
//! dispatcher is a function of the event payload and the current
//! registry/tree/drag state; every handler resolves its own failures before
//! returning to the run loop.

use anyhow::Result;
use x11rb::connection::Connection;
use x11rb::protocol::xproto::*;
use x11rb::protocol::Event;

use crate::trace::Transition;
use crate::window_query;
use crate::Wm;

/// Live drag gesture, recorded at button press and discarded at release.
/// `None` between gestures, so motion without a press is a representable
/// no-op rather than stale state.
#[derive(Debug, Clone, Copy)]
pub struct DragState {
    /// Client window the gesture started on
    pub window: Window,
    /// Frame being moved/resized
    pub frame: Window,
    /// Pointer position at press, root coordinates
    pub start_x: i32,
    pub start_y: i32,
    /// Frame geometry at press
    pub frame_x: i32,
    pub frame_y: i32,
    pub frame_width: u32,
    pub frame_height: u32,
}

/// Frame position for a move gesture: origin position plus pointer delta.
pub fn move_target(frame_origin: (i32, i32), press: (i32, i32), pointer: (i32, i32)) -> (i32, i32) {
    (
        frame_origin.0 + (pointer.0 - press.0),
        frame_origin.1 + (pointer.1 - press.1),
    )
}

/// Frame size for a resize gesture: origin size plus pointer delta, clamped
/// to 1x1 (the protocol rejects zero-sized windows).
pub fn resize_target(origin_size: (u32, u32), press: (i32, i32), pointer: (i32, i32)) -> (u32, u32) {
    let width = origin_size.0 as i64 + (pointer.0 - press.0) as i64;
    let height = origin_size.1 as i64 + (pointer.1 - press.1) as i64;
    (width.max(1) as u32, height.max(1) as u32)
}

impl Wm {
    /// Route one event to its handler
    pub fn handle_event(&mut self, event: Event) -> Result<()> {
        match event {
            // Informational only; management starts at MapRequest.
            Event::CreateNotify(e) => {
                log::debug!("CreateNotify for window 0x{:x}", e.window);
            }

            Event::ConfigureRequest(e) => {
                self.tracer.trace_event("ConfigureRequest", Some(e.window), "");
                self.on_configure_request(e)?;
            }

            Event::MapRequest(e) => {
                self.tracer.trace_event("MapRequest", Some(e.window), "");
                log::debug!("MapRequest for window 0x{:x}", e.window);
                self.on_map_request(e)?;
            }

            // Acknowledged only; we issued or allowed the configure already.
            Event::ConfigureNotify(e) => {
                log::debug!("ConfigureNotify for window 0x{:x}", e.window);
            }

            Event::UnmapNotify(e) => {
                self.tracer.trace_event("UnmapNotify", Some(e.window), "");
                log::debug!("UnmapNotify for window 0x{:x}", e.window);
                self.on_unmap_notify(e)?;
            }

            // Registry cleanup already happened when the window unmapped.
            Event::DestroyNotify(e) => {
                log::debug!("DestroyNotify for window 0x{:x}", e.window);
            }

            Event::MapNotify(e) => {
                log::debug!("MapNotify for window 0x{:x}", e.window);
            }

            Event::ReparentNotify(e) => {
                log::debug!("ReparentNotify for window 0x{:x}", e.window);
            }

            Event::ButtonPress(e) => {
                self.tracer
                    .trace_event("ButtonPress", Some(e.event), &format!("button={}", e.detail));
                self.on_button_press(e)?;
            }

            Event::ButtonRelease(e) => {
                self.tracer
                    .trace_event("ButtonRelease", Some(e.event), &format!("button={}", e.detail));
                if self.drag.take().is_some() {
                    self.tracer.trace_transition(&Transition::DragEnded);
                }
            }

            Event::MotionNotify(e) => {
                self.on_motion_notify(e)?;
            }

            Event::KeyPress(e) => {
                self.tracer
                    .trace_event("KeyPress", Some(e.event), &format!("keycode={}", e.detail));
                self.on_key_press(e)?;
            }

            Event::KeyRelease(_) => {}

            // Diagnostic only; no state change.
            Event::FocusIn(e) => {
                log::debug!("FocusIn for window 0x{:x}", e.event);
            }

            Event::FocusOut(e) => {
                log::debug!("FocusOut for window 0x{:x}", e.event);
            }

            // Protocol errors arrive in-band; there is no other recovery
            // channel, so log and keep going.
            Event::Error(e) => {
                log::error!(
                    "X11 error: request {} (opcode {}), error {:?} (code {}), resource 0x{:x}",
                    e.request_name.unwrap_or("unknown"),
                    e.major_opcode,
                    e.error_kind,
                    e.error_code,
                    e.bad_value,
                );
            }

            other => {
                log::debug!("unhandled event: {other:?}");
            }
        }

        Ok(())
    }

    /// Honor a configure request verbatim: the frame tracks the requested
    /// geometry when the window is managed, and the window itself always
    /// gets what it asked for. Frame and client may diverge briefly; the
    /// next retile reconciles them.
    fn on_configure_request(&mut self, event: ConfigureRequestEvent) -> Result<()> {
        let aux = ConfigureWindowAux::from_configure_request(&event);
        if let Some(frame) = self.clients.frame_of(event.window) {
            self.conn.configure_window(frame, &aux)?;
            log::info!(
                "configured frame 0x{:x} to {}x{}",
                frame,
                event.width,
                event.height
            );
        }
        self.conn.configure_window(event.window, &aux)?;
        self.conn.flush()?;
        log::info!(
            "configured window 0x{:x} to {}x{}",
            event.window,
            event.width,
            event.height
        );
        Ok(())
    }

    /// Map a new window. The target depends on where input focus currently
    /// sits: a focused managed client means the new window joins that
    /// client's frame, split beside its leaf; anything else (pointer-root,
    /// none, an unmanaged window) gets a fresh frame of its own.
    fn on_map_request(&mut self, event: MapRequestEvent) -> Result<()> {
        if self.clients.contains(event.window) {
            self.conn.map_window(event.window)?;
            self.conn.flush()?;
            return Ok(());
        }

        let focus = self.conn.get_input_focus()?.reply()?.focus;
        match self.clients.frame_of(focus) {
            Some(frame) => self.add_to_frame(event.window, focus, frame)?,
            None => {
                log::info!("creating new frame for window 0x{:x}", event.window);
                self.frame_window(event.window, false)?;
            }
        }
        self.conn.map_window(event.window)?;
        self.conn.flush()?;
        Ok(())
    }

    /// A managed window unmapping means the client is done with it: detach
    /// it, hand it back to the root, and collapse or retile its frame.
    fn on_unmap_notify(&mut self, event: UnmapNotifyEvent) -> Result<()> {
        if !self.clients.contains(event.window) {
            log::debug!("ignoring UnmapNotify for unmanaged window 0x{:x}", event.window);
            return Ok(());
        }
        // Reparenting a mapped window into its frame echoes an UnmapNotify
        // on the root; that one must not tear the frame down again.
        if event.event == self.root {
            log::debug!("ignoring UnmapNotify from reparent of 0x{:x}", event.window);
            return Ok(());
        }
        self.unframe_window(event.window)
    }

    /// Start a drag gesture: remember where the pointer and the frame were,
    /// raise the frame, and give the window input focus.
    fn on_button_press(&mut self, event: ButtonPressEvent) -> Result<()> {
        let window = event.event;
        let Some(frame) = self.clients.frame_of(window) else {
            self.invariant_breach(&format!("ButtonPress for unmanaged window 0x{window:x}"));
            return Ok(());
        };

        let geom = self.conn.get_geometry(frame)?.reply()?;
        self.drag = Some(DragState {
            window,
            frame,
            start_x: event.root_x as i32,
            start_y: event.root_y as i32,
            frame_x: geom.x as i32,
            frame_y: geom.y as i32,
            frame_width: geom.width as u32,
            frame_height: geom.height as u32,
        });
        self.tracer
            .trace_transition(&Transition::DragStarted { window, frame });

        self.conn.configure_window(
            frame,
            &ConfigureWindowAux::new().stack_mode(StackMode::ABOVE),
        )?;
        self.focus_client(window)?;
        Ok(())
    }

    /// Translate or resize the dragged frame, relative to the gesture origin
    fn on_motion_notify(&mut self, event: MotionNotifyEvent) -> Result<()> {
        let Some(drag) = self.drag else {
            log::debug!("MotionNotify with no active drag session");
            return Ok(());
        };
        if !self.clients.contains(drag.window) {
            return Ok(());
        }

        let pointer = (event.root_x as i32, event.root_y as i32);
        let press = (drag.start_x, drag.start_y);
        let state = u16::from(event.state);

        if state & u16::from(KeyButMask::BUTTON1) != 0 {
            let (x, y) = move_target((drag.frame_x, drag.frame_y), press, pointer);
            self.conn
                .configure_window(drag.frame, &ConfigureWindowAux::new().x(x).y(y))?;
            self.conn.flush()?;
        } else if state & u16::from(KeyButMask::BUTTON3) != 0 {
            let (width, height) =
                resize_target((drag.frame_width, drag.frame_height), press, pointer);
            self.conn.configure_window(
                drag.frame,
                &ConfigureWindowAux::new().width(width).height(height),
            )?;
            // The clients inside must follow the new interior size.
            self.retile_frame(drag.frame, width, height)?;
        }
        Ok(())
    }

    fn on_key_press(&mut self, event: KeyPressEvent) -> Result<()> {
        if u16::from(event.state) & u16::from(KeyButMask::MOD1) == 0 {
            return Ok(());
        }
        let window = event.event;
        if !self.clients.contains(window) {
            log::debug!("key press for unmanaged window 0x{window:x}");
            return Ok(());
        }

        if event.detail == self.keys.close {
            self.on_close_key(window)
        } else if event.detail == self.keys.cycle {
            self.on_cycle_focus(window)
        } else if event.detail == self.keys.release_focus {
            log::info!("releasing input focus from window 0x{window:x}");
            self.release_focus()
        } else {
            Ok(())
        }
    }

    /// Close a window: ask nicely when the client advertises the delete
    /// protocol, otherwise sever its connection.
    fn on_close_key(&mut self, window: Window) -> Result<()> {
        if window_query::supports_delete_protocol(&self.conn, &self.atoms, window) {
            log::info!("gracefully deleting window 0x{window:x}");
            window_query::send_delete_window(&self.conn, &self.atoms, window)?;
        } else {
            log::info!("killing window 0x{window:x}");
            self.conn.kill_client(window)?;
            self.conn.flush()?;
        }
        Ok(())
    }

    /// Advance focus to the next registry entry, wrapping after the last.
    /// Cycle order is registry insertion order, not spatial order.
    fn on_cycle_focus(&mut self, window: Window) -> Result<()> {
        if self.clients.is_empty() {
            log::debug!("no managed windows to cycle through");
            return Ok(());
        }
        let Some(next) = self.clients.next_after(window) else {
            return Ok(());
        };
        self.conn.configure_window(
            next.frame,
            &ConfigureWindowAux::new().stack_mode(StackMode::ABOVE),
        )?;
        self.focus_client(next.window)?;
        Ok(())
    }
}

//! rtwm - Reparenting Tiling Window Manager
//!
//! A minimal X11 window manager that wraps client windows in bordered frame
//! windows and tiles the clients inside each frame with a binary split tree.
//! Frames float freely (Mod1+drag to move or resize); their contents tile.

mod events;
mod registry;
mod trace;
mod tree;
mod window_query;

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use clap::Parser;
use x11rb::connection::Connection;
use x11rb::errors::ReplyError;
use x11rb::protocol::xproto::*;
use x11rb::protocol::ErrorKind;
use x11rb::rust_connection::RustConnection;

use events::DragState;
use registry::ClientRegistry;
use trace::{EventTracer, Transition};
use tree::{Rect, TilingTree};

// Keysyms for the grabbed bindings
const XK_F4: u32 = 0xffc1;
const XK_TAB: u32 = 0xff09;
const XK_ESCAPE: u32 = 0xff1b;

/// ICCCM atoms we need
pub struct Atoms {
    pub wm_protocols: Atom,
    pub wm_delete_window: Atom,
}

impl Atoms {
    fn new(conn: &RustConnection) -> Result<Self> {
        Ok(Self {
            wm_protocols: Self::intern(conn, b"WM_PROTOCOLS")?,
            wm_delete_window: Self::intern(conn, b"WM_DELETE_WINDOW")?,
        })
    }

    fn intern(conn: &RustConnection, name: &[u8]) -> Result<Atom> {
        Ok(conn.intern_atom(false, name)?.reply()?.atom)
    }
}

/// Frame decoration settings
struct WmConfig {
    /// Frame border width in pixels
    border_width: u32,
    /// Border color for the focused frame
    border_focused: u32,
    /// Border color for unfocused frames
    border_unfocused: u32,
    /// Frame background color
    frame_bg: u32,
}

impl Default for WmConfig {
    fn default() -> Self {
        Self {
            border_width: 3,
            border_focused: 0x9c353e,   // Muted red
            border_unfocused: 0x594646, // Gray-brown
            frame_bg: 0x594646,
        }
    }
}

/// Keycodes for the grabbed key bindings, resolved once at startup
struct Keycodes {
    /// Mod1+F4: close the window
    close: Keycode,
    /// Mod1+Tab: cycle focus through managed windows
    cycle: Keycode,
    /// Mod1+Escape: release input focus back to pointer-root
    release_focus: Keycode,
}

impl Keycodes {
    fn resolve(conn: &RustConnection) -> Result<Self> {
        let setup = conn.setup();
        let min_keycode = setup.min_keycode;
        let max_keycode = setup.max_keycode;

        let mapping = conn
            .get_keyboard_mapping(min_keycode, max_keycode - min_keycode + 1)?
            .reply()?;
        let keysyms_per_keycode = mapping.keysyms_per_keycode as usize;

        let lookup = |keysym: u32| -> Result<Keycode> {
            for (i, chunk) in mapping.keysyms.chunks(keysyms_per_keycode).enumerate() {
                if chunk.contains(&keysym) {
                    return Ok(min_keycode + i as u8);
                }
            }
            bail!("no keycode maps to keysym 0x{keysym:x}")
        };

        Ok(Self {
            close: lookup(XK_F4)?,
            cycle: lookup(XK_TAB)?,
            release_focus: lookup(XK_ESCAPE)?,
        })
    }
}

/// The window manager state
pub struct Wm {
    pub(crate) conn: RustConnection,
    pub(crate) root: Window,
    pub(crate) atoms: Atoms,
    pub(crate) keys: Keycodes,
    pub(crate) config: WmConfig,
    /// Managed clients and the frames wrapping them
    pub(crate) clients: ClientRegistry,
    /// Tiling tree for each live frame
    pub(crate) frames: HashMap<Window, TilingTree>,
    /// Live drag gesture, if a grabbed button is held
    pub(crate) drag: Option<DragState>,
    /// Client whose frame carries the focused border
    pub(crate) focused: Option<Window>,
    pub(crate) tracer: EventTracer,
    /// Display name, for the startup-conflict message
    display_name: String,
}

impl Wm {
    /// Connect to the X server and resolve what we need up front
    fn new(display: Option<&str>) -> Result<Self> {
        let (conn, screen_num) =
            RustConnection::connect(display).context("failed to connect to X11 server")?;

        let screen = &conn.setup().roots[screen_num];
        let root = screen.root;

        log::info!(
            "connected to X11, screen {}, root window 0x{:x}, {}x{}",
            screen_num,
            root,
            screen.width_in_pixels,
            screen.height_in_pixels
        );

        let atoms = Atoms::new(&conn)?;
        let keys = Keycodes::resolve(&conn)?;
        let display_name = display
            .map(str::to_owned)
            .or_else(|| std::env::var("DISPLAY").ok())
            .unwrap_or_else(|| ":0".to_owned());

        Ok(Self {
            conn,
            root,
            atoms,
            keys,
            config: WmConfig::default(),
            clients: ClientRegistry::new(),
            frames: HashMap::new(),
            drag: None,
            focused: None,
            tracer: EventTracer::new(),
            display_name,
        })
    }

    /// Become the window manager by selecting SubstructureRedirect on the
    /// root. Only one client may hold that selection; an Access error here
    /// means another manager already does.
    fn become_wm(&self) -> Result<()> {
        let event_mask = EventMask::SUBSTRUCTURE_REDIRECT
            | EventMask::SUBSTRUCTURE_NOTIFY
            | EventMask::FOCUS_CHANGE;

        let cookie = self.conn.change_window_attributes(
            self.root,
            &ChangeWindowAttributesAux::new().event_mask(event_mask),
        )?;
        if let Err(err) = cookie.check() {
            if matches!(&err, ReplyError::X11Error(e) if e.error_kind == ErrorKind::Access) {
                bail!(
                    "another window manager is already running on display {}",
                    self.display_name
                );
            }
            return Err(err).context("failed to select events on the root window");
        }

        // Start from the pointer-root focus default.
        self.conn.set_input_focus(
            InputFocus::POINTER_ROOT,
            u32::from(InputFocus::POINTER_ROOT),
            x11rb::CURRENT_TIME,
        )?;
        self.conn.flush()?;

        log::info!("successfully became the window manager");
        Ok(())
    }

    /// Frame windows that already exist. The server stays grabbed for the
    /// whole scan so no window can be mapped between enumeration and
    /// framing.
    fn adopt_existing_windows(&mut self) -> Result<()> {
        self.conn.grab_server()?;
        let result = self.scan_and_frame();
        self.conn.ungrab_server()?;
        self.conn.flush()?;
        log::info!("adopted {} existing windows", self.clients.len());
        result
    }

    fn scan_and_frame(&mut self) -> Result<()> {
        let tree = self.conn.query_tree(self.root)?.reply()?;
        for window in tree.children {
            self.frame_window(window, true)?;
        }
        Ok(())
    }

    /// Wrap `window` in a new frame with its own single-leaf tiling tree.
    ///
    /// During adoption (`adopted`), windows that are unmapped or marked
    /// override-redirect are left alone.
    pub(crate) fn frame_window(&mut self, window: Window, adopted: bool) -> Result<()> {
        if self.clients.contains(window) {
            return Ok(());
        }

        let attrs = self.conn.get_window_attributes(window)?.reply()?;
        if adopted && (attrs.override_redirect || attrs.map_state != MapState::VIEWABLE) {
            return Ok(());
        }

        let geom = self.conn.get_geometry(window)?.reply()?;
        let frame = self.conn.generate_id()?;
        self.conn.create_window(
            x11rb::COPY_DEPTH_FROM_PARENT,
            frame,
            self.root,
            geom.x,
            geom.y,
            geom.width.max(1),
            geom.height.max(1),
            self.config.border_width as u16,
            WindowClass::INPUT_OUTPUT,
            x11rb::COPY_FROM_PARENT,
            &CreateWindowAux::new()
                .background_pixel(self.config.frame_bg)
                .border_pixel(self.config.border_unfocused)
                .event_mask(
                    EventMask::SUBSTRUCTURE_REDIRECT
                        | EventMask::SUBSTRUCTURE_NOTIFY
                        | EventMask::FOCUS_CHANGE,
                ),
        )?;

        // Keep the client restorable if we crash.
        self.conn.change_save_set(SetMode::INSERT, window)?;
        self.conn.reparent_window(window, frame, 0, 0)?;
        self.conn.map_window(frame)?;
        self.grab_inputs(window)?;

        self.clients.insert(window, frame);
        let width = geom.width.max(1) as u32;
        let height = geom.height.max(1) as u32;
        self.frames
            .insert(frame, TilingTree::new(window, Rect::new(0, 0, width, height)));
        self.retile_frame(frame, width, height)?;

        self.tracer
            .trace_transition(&Transition::WindowFramed { window, frame });
        log::info!("framed window 0x{:x} [frame 0x{:x}]", window, frame);
        Ok(())
    }

    /// Insert `window` into an existing frame, split beside the leaf of the
    /// currently focused client `anchor`.
    pub(crate) fn add_to_frame(&mut self, window: Window, anchor: Window, frame: Window) -> Result<()> {
        let inserted = match self.frames.get_mut(&frame) {
            Some(tree) => match tree.find_leaf(anchor) {
                Some(target) => tree.insert(target, window).is_ok(),
                None => false,
            },
            None => false,
        };
        if !inserted {
            self.invariant_breach(&format!(
                "cannot split beside focused client 0x{anchor:x} in frame 0x{frame:x}"
            ));
            log::info!("creating new frame for window 0x{window:x} instead");
            return self.frame_window(window, false);
        }

        self.conn.change_save_set(SetMode::INSERT, window)?;
        self.conn.reparent_window(window, frame, 0, 0)?;
        self.grab_inputs(window)?;
        self.clients.insert(window, frame);
        self.apply_frame_layout(frame)?;

        self.tracer
            .trace_transition(&Transition::WindowAdded { window, frame });
        log::info!("added window 0x{:x} to frame 0x{:x}", window, frame);
        Ok(())
    }

    /// Stop managing `window`: detach it from its frame's tree, hand it back
    /// to the root, and destroy the frame if it is now empty.
    pub(crate) fn unframe_window(&mut self, window: Window) -> Result<()> {
        let Some(entry) = self.clients.remove(window) else {
            self.invariant_breach(&format!("unframe of unregistered window 0x{window:x}"));
            return Ok(());
        };
        let frame = entry.frame;

        self.conn.reparent_window(window, self.root, 0, 0)?;
        self.conn.change_save_set(SetMode::DELETE, window)?;

        let (tree_found, leaf_removed, tree_empty) = match self.frames.get_mut(&frame) {
            Some(tree) => {
                let removed = tree.remove_window(window);
                (true, removed, tree.is_empty())
            }
            None => (false, false, false),
        };

        if !tree_found {
            self.invariant_breach(&format!("no tiling tree for frame 0x{frame:x}"));
        } else if !leaf_removed {
            self.invariant_breach(&format!(
                "window 0x{window:x} was registered but absent from its frame's tree"
            ));
        }

        let mut frame_destroyed = false;
        if tree_empty {
            self.frames.remove(&frame);
            self.conn.destroy_window(frame)?;
            frame_destroyed = true;
            self.conn.set_input_focus(
                InputFocus::POINTER_ROOT,
                u32::from(InputFocus::POINTER_ROOT),
                x11rb::CURRENT_TIME,
            )?;
            log::info!("destroyed empty frame 0x{:x}", frame);
        } else if tree_found {
            self.apply_frame_layout(frame)?;
        }

        if self.focused == Some(window) {
            self.focused = None;
        }
        if self.drag.is_some_and(|d| d.window == window) {
            self.drag = None;
            log::info!("cancelled drag: dragged window went away");
        }

        self.tracer.trace_transition(&Transition::WindowUnframed {
            window,
            frame,
            frame_destroyed,
        });
        self.conn.flush()?;
        log::info!("unframed window 0x{:x} [frame 0x{:x}]", window, frame);
        Ok(())
    }

    /// Register the passive grabs every managed window gets: Mod1+Button1
    /// (move), Mod1+Button3 (resize), Mod1+F4 (close), Mod1+Tab (cycle),
    /// Mod1+Escape (release focus).
    fn grab_inputs(&self, window: Window) -> Result<()> {
        for button in [ButtonIndex::M1, ButtonIndex::M3] {
            self.conn.grab_button(
                false,
                window,
                EventMask::BUTTON_PRESS | EventMask::BUTTON_RELEASE | EventMask::BUTTON_MOTION,
                GrabMode::ASYNC,
                GrabMode::ASYNC,
                x11rb::NONE,
                x11rb::NONE,
                button,
                ModMask::M1,
            )?;
        }
        for keycode in [self.keys.close, self.keys.cycle, self.keys.release_focus] {
            self.conn.grab_key(
                false,
                window,
                ModMask::M1,
                keycode,
                GrabMode::ASYNC,
                GrabMode::ASYNC,
            )?;
        }
        Ok(())
    }

    /// Retile a frame's clients after its interior changed size
    pub(crate) fn retile_frame(&mut self, frame: Window, width: u32, height: u32) -> Result<()> {
        let geometries = self.frames.get_mut(&frame).map(|tree| {
            let root = tree.root();
            tree.recompute_geometry(root, Rect::new(0, 0, width.max(1), height.max(1)));
            tree.leaf_geometries()
        });
        let Some(geometries) = geometries else {
            self.invariant_breach(&format!("retile of unknown frame 0x{frame:x}"));
            return Ok(());
        };

        for (window, rect) in geometries {
            self.conn.configure_window(
                window,
                &ConfigureWindowAux::new()
                    .x(rect.x)
                    .y(rect.y)
                    .width(rect.width.max(1))
                    .height(rect.height.max(1)),
            )?;
        }
        self.conn.flush()?;
        Ok(())
    }

    /// Retile a frame using its current server-side geometry
    pub(crate) fn apply_frame_layout(&mut self, frame: Window) -> Result<()> {
        let geom = self.conn.get_geometry(frame)?.reply()?;
        self.retile_frame(frame, geom.width as u32, geom.height as u32)
    }

    /// Move input focus to `window` and restyle the frame borders
    pub(crate) fn focus_client(&mut self, window: Window) -> Result<()> {
        let old = self.focused;

        if let Some(old_window) = old {
            if old_window != window {
                if let Some(old_frame) = self.clients.frame_of(old_window) {
                    self.conn.change_window_attributes(
                        old_frame,
                        &ChangeWindowAttributesAux::new()
                            .border_pixel(self.config.border_unfocused),
                    )?;
                }
            }
        }

        self.conn
            .set_input_focus(InputFocus::PARENT, window, x11rb::CURRENT_TIME)?;
        if let Some(frame) = self.clients.frame_of(window) {
            self.conn.change_window_attributes(
                frame,
                &ChangeWindowAttributesAux::new().border_pixel(self.config.border_focused),
            )?;
        }
        self.focused = Some(window);

        if old != Some(window) {
            self.tracer.trace_transition(&Transition::FocusChanged {
                from: old,
                to: Some(window),
            });
        }
        self.conn.flush()?;
        Ok(())
    }

    /// Return input focus to the pointer-root default, leaving windows mapped
    pub(crate) fn release_focus(&mut self) -> Result<()> {
        if let Some(old) = self.focused.take() {
            if let Some(frame) = self.clients.frame_of(old) {
                self.conn.change_window_attributes(
                    frame,
                    &ChangeWindowAttributesAux::new().border_pixel(self.config.border_unfocused),
                )?;
            }
            self.tracer.trace_transition(&Transition::FocusChanged {
                from: Some(old),
                to: None,
            });
        }
        self.conn.set_input_focus(
            InputFocus::POINTER_ROOT,
            u32::from(InputFocus::POINTER_ROOT),
            x11rb::CURRENT_TIME,
        )?;
        self.conn.flush()?;
        Ok(())
    }

    /// Cross-check the registry against the frame trees. An intact manager
    /// yields no entries: every registered client has a leaf in its frame's
    /// tree and every tiled window is registered to its frame.
    fn validate_state(&self) -> Vec<String> {
        let mut violations = Vec::new();
        for entry in self.clients.iter() {
            match self.frames.get(&entry.frame) {
                None => violations.push(format!(
                    "client 0x{:x} maps to missing frame 0x{:x}",
                    entry.window, entry.frame
                )),
                Some(tree) => {
                    if tree.find_leaf(entry.window).is_none() {
                        violations.push(format!(
                            "client 0x{:x} has no leaf in frame 0x{:x}",
                            entry.window, entry.frame
                        ));
                    }
                }
            }
        }
        for (&frame, tree) in &self.frames {
            for violation in tree.validate() {
                violations.push(format!("frame 0x{frame:x}: {violation}"));
            }
            for window in tree.windows() {
                if self.clients.frame_of(window) != Some(frame) {
                    violations.push(format!(
                        "window 0x{window:x} tiled in frame 0x{frame:x} but not registered to it"
                    ));
                }
            }
        }
        let tiled: usize = self.frames.values().map(|t| t.len()).sum();
        if tiled != self.clients.len() {
            violations.push(format!(
                "{} windows tiled but {} registered",
                tiled,
                self.clients.len()
            ));
        }
        violations
    }

    /// A handler found state that contradicts the registry/tree contract.
    /// Other clients' windows must keep working, so log the breach with the
    /// recent transition history and skip the single event.
    pub(crate) fn invariant_breach(&self, msg: &str) {
        log::error!("invariant breach: {msg}; skipping event");
        for violation in self.validate_state() {
            log::error!("  state: {violation}");
        }
        self.tracer.dump_recent(20);
    }

    /// Main event loop: block on the next event, dispatch it to completion,
    /// repeat. Handler failures are resolved here and never escape.
    fn run(&mut self) -> Result<()> {
        log::info!("entering event loop");
        loop {
            let event = self
                .conn
                .wait_for_event()
                .context("lost connection to the X server")?;
            if let Err(e) = self.handle_event(event) {
                log::error!("error handling event: {e:#}");
            }
        }
    }
}

#[derive(Parser)]
#[command(name = "rtwm", version, about = "A reparenting tiling window manager for X11")]
struct Cli {
    /// X display to manage (defaults to $DISPLAY)
    #[arg(long)]
    display: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    log::info!("starting rtwm - Reparenting Tiling Window Manager");

    let mut wm = Wm::new(cli.display.as_deref())?;
    wm.become_wm()?;
    wm.adopt_existing_windows()?;
    wm.run()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::registry::ClientRegistry;
    use crate::tree::{Rect, SplitMode, TilingTree};

    const W1: u32 = 0x10;
    const W2: u32 = 0x20;
    const W3: u32 = 0x30;
    const F1: u32 = 0xf1;
    const F2: u32 = 0xf2;

    fn assert_consistent(clients: &ClientRegistry, frames: &HashMap<u32, TilingTree>) {
        for entry in clients.iter() {
            let tree = frames
                .get(&entry.frame)
                .unwrap_or_else(|| panic!("client 0x{:x} maps to missing frame", entry.window));
            assert!(
                tree.find_leaf(entry.window).is_some(),
                "client 0x{:x} has no leaf in its frame",
                entry.window
            );
        }
        for (&frame, tree) in frames {
            assert!(tree.validate().is_empty(), "frame 0x{frame:x} tree is invalid");
            for window in tree.windows() {
                assert_eq!(clients.frame_of(window), Some(frame));
            }
        }
    }

    // The bookkeeping a map request performs on an empty display: fresh
    // frame, fresh single-leaf tree sized to the frame interior.
    #[test]
    fn map_into_empty_display_creates_frame_and_leaf() {
        let mut clients = ClientRegistry::new();
        let mut frames: HashMap<u32, TilingTree> = HashMap::new();

        clients.insert(W1, F1);
        frames.insert(F1, TilingTree::new(W1, Rect::new(0, 0, 640, 480)));

        assert_eq!(clients.frame_of(W1), Some(F1));
        let tree = &frames[&F1];
        assert_eq!(tree.windows(), vec![W1]);
        let root = tree.get(tree.root()).unwrap();
        assert_eq!(root.mode, SplitMode::Full);
        assert_eq!(root.rect, Rect::new(0, 0, 640, 480));
        assert_consistent(&clients, &frames);
    }

    // Mapping W2 while W1 is focused splits W1's leaf horizontally: two Full
    // children, each exactly half the original height.
    #[test]
    fn map_beside_focused_window_splits_its_leaf() {
        let mut clients = ClientRegistry::new();
        let mut frames: HashMap<u32, TilingTree> = HashMap::new();
        clients.insert(W1, F1);
        frames.insert(F1, TilingTree::new(W1, Rect::new(0, 0, 640, 480)));

        let tree = frames.get_mut(&F1).unwrap();
        let target = tree.find_leaf(W1).unwrap();
        tree.insert(target, W2).unwrap();
        clients.insert(W2, F1);

        let geoms = frames[&F1].leaf_geometries();
        assert_eq!(geoms[0], (W1, Rect::new(0, 0, 640, 240)));
        assert_eq!(geoms[1], (W2, Rect::new(0, 240, 640, 240)));
        assert_consistent(&clients, &frames);
    }

    // Unmapping W1 collapses the split back to a single Full leaf holding W2
    // at the full rectangle; unmapping W2 as well empties the tree, which is
    // the dispatcher's cue to destroy the frame.
    #[test]
    fn unmap_collapses_and_then_empties_the_frame() {
        let mut clients = ClientRegistry::new();
        let mut frames: HashMap<u32, TilingTree> = HashMap::new();
        clients.insert(W1, F1);
        frames.insert(F1, TilingTree::new(W1, Rect::new(0, 0, 640, 480)));
        let tree = frames.get_mut(&F1).unwrap();
        let target = tree.find_leaf(W1).unwrap();
        tree.insert(target, W2).unwrap();
        clients.insert(W2, F1);

        clients.remove(W1);
        let tree = frames.get_mut(&F1).unwrap();
        assert!(tree.remove_window(W1));
        assert!(!tree.is_empty());
        let root = tree.get(tree.root()).unwrap();
        assert_eq!(root.mode, SplitMode::Full);
        assert_eq!(root.window, Some(W2));
        assert_eq!(root.rect, Rect::new(0, 0, 640, 480));
        assert_consistent(&clients, &frames);

        clients.remove(W2);
        let tree = frames.get_mut(&F1).unwrap();
        assert!(tree.remove_window(W2));
        assert!(tree.is_empty());
        frames.remove(&F1);
        assert!(clients.is_empty());
        assert_consistent(&clients, &frames);
    }

    // A mixed sequence across two frames keeps the registry and the trees
    // agreeing at every step.
    #[test]
    fn registry_and_trees_stay_consistent() {
        let mut clients = ClientRegistry::new();
        let mut frames: HashMap<u32, TilingTree> = HashMap::new();

        clients.insert(W1, F1);
        frames.insert(F1, TilingTree::new(W1, Rect::new(0, 0, 640, 480)));
        clients.insert(W2, F2);
        frames.insert(F2, TilingTree::new(W2, Rect::new(100, 100, 320, 240)));
        assert_consistent(&clients, &frames);

        let tree = frames.get_mut(&F2).unwrap();
        let target = tree.find_leaf(W2).unwrap();
        tree.insert(target, W3).unwrap();
        clients.insert(W3, F2);
        assert_consistent(&clients, &frames);

        clients.remove(W2);
        assert!(frames.get_mut(&F2).unwrap().remove_window(W2));
        assert_consistent(&clients, &frames);

        // Focus cycling sees the surviving entries in insertion order.
        assert_eq!(clients.next_after(W1).unwrap().window, W3);
        assert_eq!(clients.next_after(W3).unwrap().window, W1);
    }
}

//! Window property queries.
//!
//! Stateless helpers around the WM_PROTOCOLS handshake: a client that wants
//! to be asked before closing lists WM_DELETE_WINDOW in its WM_PROTOCOLS
//! property, and the manager then sends a typed client message instead of
//! killing the connection.

use anyhow::Result;
use x11rb::connection::Connection;
use x11rb::protocol::xproto::{
    AtomEnum, ClientMessageData, ClientMessageEvent, ConnectionExt, EventMask, Window,
    CLIENT_MESSAGE_EVENT,
};

use crate::Atoms;

/// Check whether a window advertises the WM_DELETE_WINDOW protocol.
pub fn supports_delete_protocol(conn: &impl Connection, atoms: &Atoms, window: Window) -> bool {
    if let Ok(cookie) = conn.get_property(false, window, atoms.wm_protocols, AtomEnum::ATOM, 0, 32)
    {
        if let Ok(reply) = cookie.reply() {
            if let Some(protocols) = reply.value32() {
                return protocols.into_iter().any(|a| a == atoms.wm_delete_window);
            }
        }
    }
    false
}

/// Ask a window to close itself via a WM_DELETE_WINDOW client message.
pub fn send_delete_window(conn: &impl Connection, atoms: &Atoms, window: Window) -> Result<()> {
    let data = ClientMessageData::from([atoms.wm_delete_window, 0u32, 0u32, 0u32, 0u32]);
    let event = ClientMessageEvent {
        response_type: CLIENT_MESSAGE_EVENT,
        format: 32,
        sequence: 0,
        window,
        type_: atoms.wm_protocols,
        data,
    };
    conn.send_event(false, window, EventMask::NO_EVENT, event)?;
    conn.flush()?;
    Ok(())
}

use rusqlite::Connection;
use uuid::Uuid;

use crate::settings;

pub const DEVICE_ID_KEY: &str = "device_id";

/// This installation's identity, generated on first use.
///
/// Managed session names embed it, so it must never change once written.
pub fn device_id(conn: &Connection) -> rusqlite::Result<String> {
    if let Some(id) = settings::get(conn, DEVICE_ID_KEY)? {
        return Ok(id);
    }
    let id = Uuid::new_v4().to_string();
    settings::set(conn, DEVICE_ID_KEY, &id)?;
    log::info!("generated device id {id}");
    Ok(id)
}

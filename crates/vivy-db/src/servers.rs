use std::path::PathBuf;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use vivy_core::{ServerConfig, ServerId};

const COLUMNS: &str = "id, name, host, port, username, identity_file, tmux_enabled, \
                       attach_behavior, remembered_session, startup_command, auto_install_tmux";

fn from_row(row: &Row<'_>) -> rusqlite::Result<ServerConfig> {
    let id: String = row.get(0)?;
    let id = id
        .parse::<ServerId>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
    let behavior: String = row.get(7)?;
    let identity_file: Option<String> = row.get(5)?;
    Ok(ServerConfig {
        id,
        name: row.get(1)?,
        host: row.get(2)?,
        port: row.get(3)?,
        username: row.get(4)?,
        identity_file: identity_file.map(PathBuf::from),
        tmux_enabled: row.get(6)?,
        attach_behavior: behavior.parse().unwrap_or_else(|e| {
            log::warn!("server {id}: {e}, using default");
            Default::default()
        }),
        remembered_session: row.get(8)?,
        startup_command: row.get(9)?,
        auto_install_tmux: row.get(10)?,
    })
}

pub fn list_servers(conn: &Connection) -> rusqlite::Result<Vec<ServerConfig>> {
    let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM servers ORDER BY name"))?;
    let rows = stmt.query_map([], from_row)?;
    rows.collect()
}

pub fn get_server(conn: &Connection, id: ServerId) -> rusqlite::Result<Option<ServerConfig>> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM servers WHERE id = ?1"),
        params![id.to_string()],
        from_row,
    )
    .optional()
}

/// Look a server up by name, falling back to its id.
pub fn find_server(conn: &Connection, name_or_id: &str) -> rusqlite::Result<Option<ServerConfig>> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM servers WHERE name = ?1 OR id = ?1"),
        params![name_or_id],
        from_row,
    )
    .optional()
}

pub fn upsert_server(conn: &Connection, server: &ServerConfig) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO servers ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                host = excluded.host,
                port = excluded.port,
                username = excluded.username,
                identity_file = excluded.identity_file,
                tmux_enabled = excluded.tmux_enabled,
                attach_behavior = excluded.attach_behavior,
                remembered_session = excluded.remembered_session,
                startup_command = excluded.startup_command,
                auto_install_tmux = excluded.auto_install_tmux"
        ),
        params![
            server.id.to_string(),
            server.name,
            server.host,
            server.port,
            server.username,
            server
                .identity_file
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            server.tmux_enabled,
            server.attach_behavior.as_str(),
            server.remembered_session,
            server.startup_command,
            server.auto_install_tmux,
        ],
    )?;
    Ok(())
}

pub fn delete_server(conn: &Connection, id: ServerId) -> rusqlite::Result<bool> {
    let changed = conn.execute("DELETE FROM servers WHERE id = ?1", params![id.to_string()])?;
    Ok(changed > 0)
}

pub fn set_remembered_session(
    conn: &Connection,
    id: ServerId,
    name: Option<&str>,
) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE servers SET remembered_session = ?2 WHERE id = ?1",
        params![id.to_string(), name],
    )?;
    Ok(changed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vivy_core::AttachBehavior;

    fn server(name: &str) -> ServerConfig {
        let mut server = ServerConfig::new(name, format!("{name}.example.org"));
        server.username = Some("deploy".into());
        server.identity_file = Some(PathBuf::from("/home/me/.ssh/id_ed25519"));
        server.attach_behavior = AttachBehavior::AskEveryTime;
        server
    }

    #[test]
    fn test_upsert_and_get() {
        let conn = crate::open_in_memory().unwrap();
        let mut web = server("web");
        upsert_server(&conn, &web).unwrap();
        assert_eq!(get_server(&conn, web.id).unwrap(), Some(web.clone()));

        web.port = 2200;
        web.tmux_enabled = false;
        upsert_server(&conn, &web).unwrap();
        let stored = get_server(&conn, web.id).unwrap().unwrap();
        assert_eq!(stored.port, 2200);
        assert!(!stored.tmux_enabled);
        assert_eq!(list_servers(&conn).unwrap().len(), 1);
    }

    #[test]
    fn test_find_by_name_or_id() {
        let conn = crate::open_in_memory().unwrap();
        let db = server("db");
        upsert_server(&conn, &db).unwrap();

        assert_eq!(find_server(&conn, "db").unwrap().map(|s| s.id), Some(db.id));
        assert_eq!(
            find_server(&conn, &db.id.to_string()).unwrap().map(|s| s.id),
            Some(db.id)
        );
        assert!(find_server(&conn, "nope").unwrap().is_none());
    }

    #[test]
    fn test_list_sorted_and_delete() {
        let conn = crate::open_in_memory().unwrap();
        let b = server("beta");
        let a = server("alpha");
        upsert_server(&conn, &b).unwrap();
        upsert_server(&conn, &a).unwrap();

        let names: Vec<String> = list_servers(&conn).unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alpha", "beta"]);

        assert!(delete_server(&conn, a.id).unwrap());
        assert!(!delete_server(&conn, a.id).unwrap());
        assert_eq!(list_servers(&conn).unwrap().len(), 1);
    }

    #[test]
    fn test_set_remembered_session() {
        let conn = crate::open_in_memory().unwrap();
        let s = server("box");
        upsert_server(&conn, &s).unwrap();

        assert!(set_remembered_session(&conn, s.id, Some("work")).unwrap());
        assert_eq!(
            get_server(&conn, s.id).unwrap().unwrap().remembered_session.as_deref(),
            Some("work")
        );
        set_remembered_session(&conn, s.id, None).unwrap();
        assert!(get_server(&conn, s.id).unwrap().unwrap().remembered_session.is_none());
        assert!(!set_remembered_session(&conn, ServerId::new(), Some("x")).unwrap());
    }
}

// Copyright 2025 Apache Doris Community
// Licensed under the Apache License, Version 2.0

//! Demo statement driver: acknowledges every statement without running it,
//! tracking just enough session state to report sensible status flags.

use async_trait::async_trait;
use sqlgate_common::{GateError, Result};
use sqlgate_mysql::constants::{SERVER_STATUS_AUTOCOMMIT, SERVER_STATUS_IN_TRANS};
use sqlgate_mysql::{
    Command, CommandKind, Reply, SessionFactory, SessionParams, StatementExecutor,
};
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct AckSession {
    pub connection_id: u32,
    pub database: Option<String>,
    pub in_transaction: bool,
    pub statements: u64,
}

#[derive(Debug, Default)]
pub struct AckDriver;

impl AckDriver {
    fn status_of(session: &AckSession) -> u16 {
        if session.in_transaction {
            SERVER_STATUS_AUTOCOMMIT | SERVER_STATUS_IN_TRANS
        } else {
            SERVER_STATUS_AUTOCOMMIT
        }
    }
}

impl SessionFactory for AckDriver {
    type Session = AckSession;

    fn open_session(&self, params: &SessionParams) -> Result<AckSession> {
        debug!(
            "Opening session {} for '{}' ({} attributes)",
            params.connection_id,
            params.username,
            params.attributes.len()
        );
        Ok(AckSession {
            connection_id: params.connection_id,
            database: params.database.clone(),
            ..Default::default()
        })
    }

    fn close_session(&self, session: AckSession) {
        debug!(
            "Closing session {} after {} statements",
            session.connection_id, session.statements
        );
    }
}

#[async_trait]
impl StatementExecutor for AckDriver {
    fn parse(&self, _session: &mut AckSession, sql: &str) -> Result<Vec<String>> {
        split_statements(sql)
    }

    async fn execute(&self, session: &mut AckSession, statement: &str) -> Result<u16> {
        session.statements += 1;
        let mut words = statement.split_whitespace();
        let keyword = words.next().unwrap_or_default().to_ascii_uppercase();

        match keyword.as_str() {
            "BEGIN" => session.in_transaction = true,
            "START" if words.next().is_some_and(|w| w.eq_ignore_ascii_case("TRANSACTION")) => {
                session.in_transaction = true
            }
            "COMMIT" | "ROLLBACK" => session.in_transaction = false,
            "USE" => {
                let db = words
                    .next()
                    .map(|w| w.trim_matches('`').to_string())
                    .ok_or_else(|| {
                        GateError::Execution("USE requires a database name".to_string())
                    })?;
                info!("Session {} switched to database {}", session.connection_id, db);
                session.database = Some(db);
            }
            _ => {}
        }

        debug!("Acknowledged: {}", statement);
        Ok(Self::status_of(session))
    }

    fn status(&self, session: &AckSession) -> u16 {
        Self::status_of(session)
    }

    async fn on_command(
        &self,
        session: &mut AckSession,
        command: &Command<'_>,
    ) -> Result<Reply> {
        match command.kind {
            CommandKind::Ping => Ok(Reply::Ok(Self::status_of(session))),
            // Clients wait for an answer to COM_INIT_DB
            CommandKind::InitDb => {
                session.database = Some(String::from_utf8_lossy(command.payload).into_owned());
                Ok(Reply::Ok(Self::status_of(session)))
            }
            _ => Ok(Reply::None),
        }
    }
}

/// Split on `;` outside quotes and backticks, dropping empty statements.
pub fn split_statements(sql: &str) -> Result<Vec<String>> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = sql.chars();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == '\\' && q != '`' {
                    if let Some(escaped) = chars.next() {
                        current.push(escaped);
                    }
                } else if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' | '`' => {
                    quote = Some(c);
                    current.push(c);
                }
                ';' => {
                    push_statement(&mut statements, &current);
                    current.clear();
                }
                _ => current.push(c),
            },
        }
    }

    if let Some(q) = quote {
        return Err(GateError::Execution(format!("unterminated {} in query", q)));
    }
    push_statement(&mut statements, &current);
    Ok(statements)
}

fn push_statement(statements: &mut Vec<String>, text: &str) {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
}

//! Parameterized query templates with schema interpolation.
//!
//! Every template carries the literal token `{{schema}}`, substituted with
//! the configured schema name before the statement is prepared. The token
//! never appears inside parameter values; dynamic data always travels
//! through binds.

use crate::types::TaskState;

pub(crate) const SCHEMA_TOKEN: &str = "{{schema}}";

/// Schema names are interpolated into SQL text, so they are restricted to
/// identifier characters and validated once at bus construction.
pub(crate) fn is_valid_schema(schema: &str) -> bool {
    !schema.is_empty()
        && schema.len() <= 63
        && schema.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !schema.starts_with(|c: char| c.is_ascii_digit())
}

/// Replace `{{schema}}` in `template` with the given schema name.
pub(crate) fn render_schema(template: &str, schema: &str) -> String {
    template.replace(SCHEMA_TOKEN, schema)
}

/// The set of query plans for one schema. Methods return rendered SQL text;
/// bind positions are documented per method.
#[derive(Debug, Clone)]
pub(crate) struct Plans {
    schema: String,
}

impl Plans {
    /// `schema` must already have passed [`is_valid_schema`].
    pub fn new(schema: &str) -> Self {
        Self {
            schema: schema.to_string(),
        }
    }

    fn render(&self, template: &str) -> String {
        render_schema(template, &self.schema)
    }

    /// Bulk-insert tasks. `$1`: JSON array of [`InsertTask`](crate::types::InsertTask)
    /// records. `ON CONFLICT DO NOTHING` enforces singleton dedup through the
    /// partial unique index.
    pub fn create_tasks(&self) -> String {
        self.render(&format!(
            r#"
    INSERT INTO {{{{schema}}}}.tasks (
      id,
      queue,
      data,
      state,
      retry_limit,
      retry_delay,
      retry_backoff,
      start_after,
      expire_in,
      keep_until,
      singleton_key
    )
    SELECT
      gen_random_uuid(),
      queue,
      data,
      {created}::smallint,
      retry_limit,
      retry_delay,
      retry_backoff,
      now() + start_after_seconds * interval '1s',
      expire_in_seconds * interval '1s',
      now() + keep_in_seconds * interval '1s',
      singleton_key
    FROM json_to_recordset($1::json) as x(
      queue text,
      data jsonb,
      retry_limit integer,
      retry_delay integer,
      retry_backoff boolean,
      start_after_seconds integer,
      expire_in_seconds integer,
      keep_in_seconds integer,
      singleton_key text
    )
    ON CONFLICT DO NOTHING"#,
            created = TaskState::Created.as_i16(),
        ))
    }

    /// Append events. `$1`: JSON array of [`Event`](crate::types::Event) records.
    pub fn create_events(&self) -> String {
        self.render(
            r#"
    INSERT INTO {{schema}}.events (
      event_name,
      event_data
    )
    SELECT
      event_name,
      data as event_data
    FROM json_to_recordset($1::json) as x(
      event_name text,
      data jsonb
    )"#,
        )
    }

    /// Current tip of the event log. No binds; returns zero or one row.
    pub fn get_last_event_position(&self) -> String {
        self.render(
            r#"
    SELECT position
    FROM {{schema}}.events
    -- position > 0 needed for index scan
    WHERE position > 0
    ORDER BY position DESC
    LIMIT 1"#,
        )
    }

    /// Create the service cursor if absent. `$1`: service name, `$2`: initial
    /// position (the current event tip, so prior history is skipped).
    pub fn ensure_cursor(&self) -> String {
        self.render(
            r#"
    INSERT INTO {{schema}}.cursors (service_name, last_position)
    VALUES ($1, $2)
    ON CONFLICT DO NOTHING"#,
        )
    }

    /// Lock this service's cursor and read events past it, ascending.
    /// `$1`: service name, `$2`: fetch limit. Under contention the
    /// `SKIP LOCKED` subselect yields no cursor row and therefore no events,
    /// making concurrent fanout a silent no-op.
    pub fn fetch_events_past_cursor(&self) -> String {
        self.render(
            r#"
    SELECT
      id,
      event_name,
      event_data,
      position
    FROM {{schema}}.events
    -- position > 0 needed for index scan
    WHERE position > 0
      AND position > (
        SELECT last_position
        FROM {{schema}}.cursors
        WHERE service_name = $1
        LIMIT 1
        FOR UPDATE
        SKIP LOCKED
      )
    ORDER BY position ASC
    LIMIT $2"#,
        )
    }

    /// Insert fanned-out tasks and advance the cursor in one statement.
    /// `$1`: JSON array of `InsertTask` records, `$2`: new cursor position,
    /// `$3`: service name. Runs inside the fanout transaction.
    pub fn insert_tasks_and_advance_cursor(&self) -> String {
        let insert = self.create_tasks();
        self.render(&format!(
            r#"
    WITH new_tasks AS (
      {insert}
    )
    UPDATE {{{{schema}}}}.cursors
    SET last_position = $2
    WHERE service_name = $3"#,
        ))
    }

    /// Atomically claim up to `$2` runnable tasks for queue `$1`.
    pub fn claim_tasks(&self) -> String {
        self.render(&format!(
            r#"
    WITH _tasks AS (
      SELECT id
      FROM {{{{schema}}}}.tasks
      WHERE queue = $1
        AND start_after < now()
        AND state < {active}
      ORDER BY created_on ASC
      LIMIT $2
      FOR UPDATE SKIP LOCKED
    )
    UPDATE {{{{schema}}}}.tasks t
    SET
      state = {active}::smallint,
      started_on = now(),
      retry_count = CASE WHEN t.state = {retry}
                    THEN t.retry_count + 1
                    ELSE t.retry_count END
    FROM _tasks
    WHERE t.id = _tasks.id
    RETURNING t.id, t.retry_count, t.state, t.data,
      (EXTRACT(epoch FROM t.expire_in))::int as expire_in_seconds"#,
            active = TaskState::Active.as_i16(),
            retry = TaskState::Retry.as_i16(),
        ))
    }

    /// Resolve a batch of completions in one round trip. `$1`: JSON array of
    /// [`Resolution`](crate::types::Resolution) records. Failures branch to
    /// retry or failed per the full-jitter backoff rule. Both branches touch
    /// only rows still active, so a stale resolution from a superseded
    /// dispatch cannot clobber a row another worker has re-claimed.
    pub fn resolve_tasks(&self) -> String {
        self.render(&format!(
            r#"
    WITH _in AS (
      SELECT
        x.task_id,
        x.success,
        x.payload
      FROM json_to_recordset($1::json) as x(
        task_id uuid,
        success boolean,
        payload jsonb
      )
    ), _failed AS (
      UPDATE {{{{schema}}}}.tasks t
      SET
        state = CASE
          WHEN retry_count < retry_limit THEN {retry}::smallint
          ELSE {failed}::smallint
          END,
        completed_on = CASE WHEN retry_count < retry_limit THEN NULL ELSE now() END,
        start_after = CASE
                      WHEN retry_count = retry_limit THEN start_after
                      WHEN NOT retry_backoff THEN now() + retry_delay * interval '1s'
                      ELSE now() +
                        (
                            retry_delay * 2 ^ LEAST(16, retry_count + 1) / 2
                            +
                            retry_delay * 2 ^ LEAST(16, retry_count + 1) / 2 * random()
                        )
                        * interval '1s'
                      END,
        output = _in.payload
      FROM _in
      WHERE t.id = _in.task_id
        AND _in.success = false
        AND t.state = {active}
    )
    UPDATE {{{{schema}}}}.tasks t
    SET
      state = {completed}::smallint,
      completed_on = now(),
      output = _in.payload
    FROM _in
    WHERE t.id = _in.task_id
      AND _in.success = true
      AND t.state = {active}"#,
            retry = TaskState::Retry.as_i16(),
            failed = TaskState::Failed.as_i16(),
            completed = TaskState::Completed.as_i16(),
            active = TaskState::Active.as_i16(),
        ))
    }

    /// Move overdue active rows to retry (with backoff) or expired. No binds.
    pub fn expire_tasks(&self) -> String {
        self.render(&format!(
            r#"
    UPDATE {{{{schema}}}}.tasks
    SET state = CASE
        WHEN retry_count < retry_limit THEN {retry}::smallint
        ELSE {expired}::smallint
        END,
      completed_on = CASE
                    WHEN retry_count < retry_limit
                    THEN NULL
                    ELSE now()
                    END,
      start_after = CASE
                    WHEN retry_count = retry_limit THEN start_after
                    WHEN NOT retry_backoff THEN now() + retry_delay * interval '1s'
                    ELSE now() +
                      (
                          retry_delay * 2 ^ LEAST(16, retry_count + 1) / 2
                          +
                          retry_delay * 2 ^ LEAST(16, retry_count + 1) / 2 * random()
                      )
                      * interval '1s'
                    END
    WHERE state = {active}
      AND (started_on + expire_in) < now()"#,
            retry = TaskState::Retry.as_i16(),
            expired = TaskState::Expired.as_i16(),
            active = TaskState::Active.as_i16(),
        ))
    }

    /// Delete terminal rows past their retention. No binds.
    pub fn purge_tasks(&self) -> String {
        self.render(&format!(
            r#"
    DELETE FROM {{{{schema}}}}.tasks
    WHERE state >= {completed}
      AND keep_until < now()"#,
            completed = TaskState::Completed.as_i16(),
        ))
    }

    /// Age out events past the retention horizon. `$1`: retention in days.
    pub fn delete_expired_events(&self) -> String {
        self.render(
            r#"
    DELETE FROM {{schema}}.events
    WHERE expire_at < now()
       OR created_at < (now() - interval '1 day' * $1)"#,
        )
    }

    /// Does a table exist in this schema? `$1`: table name.
    pub fn table_exists(&self) -> String {
        self.render(
            r#"
    SELECT EXISTS (
      SELECT FROM information_schema.tables
      WHERE table_schema = '{{schema}}'
      AND   table_name   = $1
    ) as exists"#,
        )
    }

    /// All applied migrations, ordered. No binds.
    pub fn get_migrations(&self) -> String {
        self.render(
            r#"
    SELECT id, name, hash FROM {{schema}}.tbus_migrations ORDER BY id"#,
        )
    }

    /// Record an applied migration. `$1`: id, `$2`: name, `$3`: hash.
    pub fn insert_migration(&self) -> String {
        self.render(
            r#"
    INSERT INTO
      {{schema}}.tbus_migrations (id, name, hash)
    VALUES ($1, $2, $3)"#,
        )
    }
}

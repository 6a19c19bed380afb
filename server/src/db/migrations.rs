//! Ordered schema migrations. Never edit a shipped batch; append a new
//! one. `db::migrate` applies anything past `PRAGMA user_version`.

pub const MIGRATIONS: &[&str] = &[
    // v1: core fleet schema.
    r#"
    CREATE TABLE printers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        model TEXT NOT NULL DEFAULT '',
        api_type TEXT NOT NULL,
        api_host TEXT NOT NULL,
        credentials TEXT NOT NULL DEFAULT '',
        slot_count INTEGER NOT NULL DEFAULT 1,
        bed_width_mm REAL,
        bed_depth_mm REAL,
        is_active INTEGER NOT NULL DEFAULT 1,
        last_error TEXT,
        total_print_hours REAL NOT NULL DEFAULT 0,
        total_print_count INTEGER NOT NULL DEFAULT 0,
        hours_since_service REAL NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE filament_slots (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        printer_id INTEGER NOT NULL REFERENCES printers(id) ON DELETE CASCADE,
        slot_number INTEGER NOT NULL,
        filament_type TEXT,
        color TEXT,
        color_hex TEXT,
        assigned_spool_id INTEGER,
        spool_confirmed INTEGER NOT NULL DEFAULT 0,
        loaded_at TEXT,
        UNIQUE (printer_id, slot_number)
    );

    CREATE TABLE filament_library (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        brand TEXT NOT NULL,
        name TEXT NOT NULL,
        material TEXT NOT NULL,
        color_hex TEXT NOT NULL,
        cost_per_gram REAL NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    );

    CREATE TABLE spools (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        library_id INTEGER REFERENCES filament_library(id),
        qr_code TEXT UNIQUE,
        rfid_tag TEXT UNIQUE,
        material TEXT NOT NULL,
        color_hex TEXT NOT NULL DEFAULT '',
        initial_grams REAL NOT NULL,
        remaining_grams REAL NOT NULL,
        empty_spool_grams REAL NOT NULL DEFAULT 250,
        low_threshold_grams REAL NOT NULL DEFAULT 100,
        status TEXT NOT NULL DEFAULT 'active',
        location_printer_id INTEGER REFERENCES printers(id) ON DELETE SET NULL,
        location_slot INTEGER,
        storage_location TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE spool_usage (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        spool_id INTEGER NOT NULL REFERENCES spools(id),
        job_id INTEGER,
        grams REAL NOT NULL,
        notes TEXT,
        created_at TEXT NOT NULL
    );

    CREATE TABLE artifacts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        file_id TEXT NOT NULL UNIQUE,
        file_name TEXT NOT NULL,
        file_path TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        content_hash TEXT NOT NULL,
        est_print_seconds INTEGER,
        total_grams REAL,
        filaments TEXT,
        thumbnail_png TEXT,
        printer_models TEXT,
        bed_width_mm REAL,
        bed_depth_mm REAL,
        supports_used INTEGER NOT NULL DEFAULT 0,
        model_id INTEGER,
        created_at TEXT NOT NULL
    );
    CREATE INDEX idx_artifacts_hash ON artifacts(content_hash);

    CREATE TABLE models (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        build_time_hours REAL NOT NULL DEFAULT 0,
        default_filament_type TEXT NOT NULL DEFAULT 'PLA',
        color_requirements TEXT,
        thumbnail_png TEXT,
        artifact_id INTEGER REFERENCES artifacts(id),
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        model_id INTEGER REFERENCES models(id) ON DELETE SET NULL,
        artifact_id INTEGER REFERENCES artifacts(id) ON DELETE SET NULL,
        item_name TEXT NOT NULL,
        quantity INTEGER NOT NULL DEFAULT 1,
        priority INTEGER NOT NULL DEFAULT 3,
        status TEXT NOT NULL DEFAULT 'submitted',
        material_type TEXT NOT NULL DEFAULT 'PLA',
        colors TEXT,
        duration_minutes INTEGER,
        hold INTEGER NOT NULL DEFAULT 0,
        due_date TEXT,
        printer_id INTEGER REFERENCES printers(id) ON DELETE SET NULL,
        scheduled_start TEXT,
        scheduled_end TEXT,
        actual_start TEXT,
        actual_end TEXT,
        is_locked INTEGER NOT NULL DEFAULT 0,
        estimated_cost REAL,
        suggested_price REAL,
        fail_reason TEXT,
        notes TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX idx_jobs_status ON jobs(status);
    CREATE INDEX idx_jobs_printer ON jobs(printer_id);

    CREATE TABLE scheduler_runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        started_at TEXT NOT NULL,
        finished_at TEXT NOT NULL,
        candidate_count INTEGER NOT NULL,
        scheduled_count INTEGER NOT NULL,
        skipped_count INTEGER NOT NULL,
        setup_blocks INTEGER NOT NULL,
        notes TEXT
    );

    CREATE TABLE print_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        printer_id INTEGER NOT NULL REFERENCES printers(id) ON DELETE CASCADE,
        job_id INTEGER,
        file_name TEXT NOT NULL,
        progress REAL,
        remaining_minutes INTEGER,
        layer INTEGER,
        total_layers INTEGER,
        status TEXT NOT NULL DEFAULT 'running',
        started_at TEXT NOT NULL,
        ended_at TEXT
    );
    CREATE INDEX idx_print_records_printer ON print_records(printer_id);

    CREATE TABLE telemetry (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        printer_id INTEGER NOT NULL REFERENCES printers(id) ON DELETE CASCADE,
        bed_temp REAL,
        nozzle_temp REAL,
        bed_target REAL,
        nozzle_target REAL,
        fan_speed INTEGER,
        recorded_at TEXT NOT NULL
    );
    CREATE INDEX idx_telemetry_printer_time ON telemetry(printer_id, recorded_at);

    CREATE TABLE hms_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        printer_id INTEGER NOT NULL REFERENCES printers(id) ON DELETE CASCADE,
        code TEXT NOT NULL,
        message TEXT NOT NULL,
        severity TEXT NOT NULL,
        occurred_at TEXT NOT NULL
    );

    CREATE TABLE alerts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        severity TEXT NOT NULL,
        user_id INTEGER NOT NULL,
        title TEXT NOT NULL,
        message TEXT NOT NULL,
        is_read INTEGER NOT NULL DEFAULT 0,
        is_dismissed INTEGER NOT NULL DEFAULT 0,
        printer_id INTEGER,
        job_id INTEGER,
        spool_id INTEGER,
        created_at TEXT NOT NULL
    );
    CREATE INDEX idx_alerts_user ON alerts(user_id, is_read);

    CREATE TABLE alert_preferences (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL UNIQUE,
        in_app INTEGER NOT NULL DEFAULT 1,
        email INTEGER NOT NULL DEFAULT 0,
        push INTEGER NOT NULL DEFAULT 0,
        webhook INTEGER NOT NULL DEFAULT 1,
        min_severity TEXT NOT NULL DEFAULT 'info',
        quiet_start TEXT,
        quiet_end TEXT,
        email_address TEXT
    );

    CREATE TABLE webhook_endpoints (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        kind TEXT NOT NULL DEFAULT 'generic',
        url TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        events TEXT NOT NULL DEFAULT '*',
        created_at TEXT NOT NULL
    );

    CREATE TABLE audit_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        action TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL DEFAULT '',
        actor TEXT NOT NULL DEFAULT 'system',
        ip_address TEXT,
        details TEXT
    );
    CREATE INDEX idx_audit_time ON audit_logs(timestamp)
    "#,
    // v2: partial unique index enforcing one active spool per slot.
    r#"
    CREATE UNIQUE INDEX idx_spools_active_slot
        ON spools(location_printer_id, location_slot)
        WHERE status = 'active' AND location_printer_id IS NOT NULL
    "#,
];

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS instances (
    id TEXT PRIMARY KEY NOT NULL,
    school_id TEXT NOT NULL,
    name TEXT NOT NULL,
    gateway_instance_id TEXT NOT NULL,
    gateway_token TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'disconnected'
        CHECK (status IN ('disconnected', 'connecting', 'connected', 'error')),
    qr_payload TEXT,
    qr_issued_at INTEGER,
    qr_expires_at INTEGER,
    qr_attempts INTEGER NOT NULL DEFAULT 0,
    phone_number TEXT,
    webhook_url TEXT,
    webhook_secret TEXT,
    last_connected_at INTEGER,
    last_error TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_instances_school ON instances(school_id);
CREATE UNIQUE INDEX IF NOT EXISTS ux_instances_school_active
    ON instances(school_id) WHERE is_active = 1;
CREATE UNIQUE INDEX IF NOT EXISTS ux_instances_school_session
    ON instances(school_id) WHERE status IN ('connecting', 'connected');

CREATE TABLE IF NOT EXISTS contacts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    instance_id TEXT NOT NULL,
    wa_id TEXT NOT NULL,
    name TEXT,
    phone TEXT,
    is_group INTEGER NOT NULL DEFAULT 0,
    lead_id TEXT,
    student_id TEXT,
    last_activity_at INTEGER,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    UNIQUE(instance_id, wa_id),
    FOREIGN KEY (instance_id) REFERENCES instances(id)
);

CREATE INDEX IF NOT EXISTS idx_contacts_instance ON contacts(instance_id);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    instance_id TEXT NOT NULL,
    contact_id INTEGER NOT NULL,
    direction TEXT NOT NULL CHECK (direction IN ('inbound', 'outbound')),
    content TEXT,
    media_url TEXT,
    media_mime TEXT,
    status TEXT NOT NULL
        CHECK (status IN ('pending', 'sent', 'delivered', 'read', 'failed')),
    external_id TEXT,
    timestamp INTEGER NOT NULL,
    sent_at INTEGER,
    delivered_at INTEGER,
    read_at INTEGER,
    metadata TEXT,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    UNIQUE(instance_id, external_id),
    FOREIGN KEY (instance_id) REFERENCES instances(id),
    FOREIGN KEY (contact_id) REFERENCES contacts(id)
);

CREATE INDEX IF NOT EXISTS idx_messages_contact ON messages(contact_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_messages_instance ON messages(instance_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_messages_unread
    ON messages(contact_id) WHERE direction = 'inbound' AND status IN ('pending', 'sent', 'delivered');

CREATE TABLE IF NOT EXISTS templates (
    id TEXT PRIMARY KEY NOT NULL,
    school_id TEXT,
    name TEXT NOT NULL,
    category TEXT NOT NULL DEFAULT 'general',
    content TEXT NOT NULL,
    variables_json TEXT NOT NULL DEFAULT '[]',
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_templates_school ON templates(school_id);
"#;

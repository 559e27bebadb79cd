use sqlx::SqlitePool;

/// In-code migrations, tracked in a `_migrations` table so the server can
/// be restarted against an existing database safely.
pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    // WAL for better concurrent access
    sqlx::query("PRAGMA journal_mode=WAL").execute(pool).await?;
    sqlx::query("PRAGMA foreign_keys=ON").execute(pool).await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS _migrations (
            name TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .execute(pool)
    .await?;

    if !is_applied(pool, "001_init").await? {
        for statement in INIT_STATEMENTS {
            sqlx::query(statement).execute(pool).await?;
        }
        mark_applied(pool, "001_init").await?;
        tracing::info!("Applied migration: 001_init");
    }

    if !is_applied(pool, "002_seed_services").await? {
        sqlx::query(
            "INSERT INTO services (name, description, price, duration_min, sort_order, is_active) VALUES
                ('Haircut', 'Classic cut', 2500, 30, 1, 1),
                ('Haircut + Beard', 'Cut and beard trim', 3500, 45, 2, 1),
                ('Beard Trim', 'Beard shaping and trim', 1500, 15, 3, 1),
                ('Head Shave', 'Full head shave with razor', 2000, 30, 4, 1),
                ('Kids Haircut', 'Under 12', 1800, 30, 5, 1)",
        )
        .execute(pool)
        .await?;
        mark_applied(pool, "002_seed_services").await?;
        tracing::info!("Applied migration: 002_seed_services");
    }

    if !is_applied(pool, "003_indexes").await? {
        for statement in INDEX_STATEMENTS {
            sqlx::query(statement).execute(pool).await?;
        }
        mark_applied(pool, "003_indexes").await?;
        tracing::info!("Applied migration: 003_indexes");
    }

    tracing::info!("Database migrations up to date");
    Ok(())
}

async fn is_applied(pool: &SqlitePool, name: &str) -> anyhow::Result<bool> {
    let applied: bool =
        sqlx::query_scalar("SELECT COUNT(*) > 0 FROM _migrations WHERE name = ?")
            .bind(name)
            .fetch_one(pool)
            .await?;
    Ok(applied)
}

async fn mark_applied(pool: &SqlitePool, name: &str) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO _migrations (name) VALUES (?)")
        .bind(name)
        .execute(pool)
        .await?;
    Ok(())
}

const INIT_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS services (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        price INTEGER NOT NULL,
        duration_min INTEGER NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        sort_order INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS guest_customers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        email TEXT NOT NULL,
        phone TEXT NOT NULL,
        stripe_customer_id TEXT,
        stripe_payment_method_id TEXT,
        no_show_count INTEGER NOT NULL DEFAULT 0,
        late_cancellation_count INTEGER NOT NULL DEFAULT 0,
        notes TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS bookings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER,
        guest_customer_id INTEGER REFERENCES guest_customers(id),
        customer_name TEXT NOT NULL,
        customer_email TEXT NOT NULL,
        customer_phone TEXT NOT NULL,
        barber TEXT,
        location TEXT,
        date TEXT NOT NULL,
        time TEXT NOT NULL,
        total_price INTEGER NOT NULL DEFAULT 0,
        total_duration INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending',
        payment_mode TEXT NOT NULL DEFAULT 'pay_at_venue',
        payment_status TEXT NOT NULL DEFAULT 'pending',
        is_paid INTEGER NOT NULL DEFAULT 0,
        cancellation_policy_accepted INTEGER NOT NULL DEFAULT 0,
        cancellation_policy_accepted_at TEXT,
        cancellation_reason TEXT,
        cancelled_at TEXT,
        stripe_customer_id TEXT,
        stripe_setup_intent_id TEXT,
        stripe_payment_method_id TEXT,
        stripe_payment_intent_id TEXT,
        card_setup_complete INTEGER NOT NULL DEFAULT 0,
        notes TEXT,
        source TEXT NOT NULL DEFAULT 'Website',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS booking_services (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        booking_id INTEGER NOT NULL REFERENCES bookings(id),
        service_id INTEGER NOT NULL,
        service_name TEXT NOT NULL,
        price INTEGER NOT NULL,
        duration_min INTEGER NOT NULL
    )",
    // Insert-only trails. No code path updates or deletes rows here.
    "CREATE TABLE IF NOT EXISTS booking_audit_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        booking_id INTEGER NOT NULL REFERENCES bookings(id),
        action TEXT NOT NULL,
        performed_by TEXT NOT NULL,
        performed_at TEXT NOT NULL,
        details TEXT NOT NULL DEFAULT ''
    )",
    "CREATE TABLE IF NOT EXISTS charge_attempts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        booking_id INTEGER NOT NULL REFERENCES bookings(id),
        attempted_at TEXT NOT NULL,
        amount INTEGER NOT NULL,
        reason TEXT NOT NULL,
        success INTEGER NOT NULL,
        payment_intent_id TEXT,
        error_message TEXT
    )",
    "CREATE TABLE IF NOT EXISTS gift_cards (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        code TEXT NOT NULL UNIQUE,
        balance INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'active',
        expires_at TEXT,
        created_at TEXT NOT NULL
    )",
    // Gateway event dedup: INSERT OR IGNORE, zero rows changed = replay.
    "CREATE TABLE IF NOT EXISTS webhook_events (
        event_id TEXT PRIMARY KEY,
        received_at TEXT NOT NULL
    )",
];

const INDEX_STATEMENTS: &[&str] = &[
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_guest_customers_email_phone
     ON guest_customers(lower(email), phone)",
    "CREATE INDEX IF NOT EXISTS idx_bookings_date ON bookings(date)",
    "CREATE INDEX IF NOT EXISTS idx_bookings_guest ON bookings(guest_customer_id)",
    "CREATE INDEX IF NOT EXISTS idx_bookings_status ON bookings(status)",
    "CREATE INDEX IF NOT EXISTS idx_bookings_setup_intent ON bookings(stripe_setup_intent_id)",
    "CREATE INDEX IF NOT EXISTS idx_booking_services_booking ON booking_services(booking_id)",
    "CREATE INDEX IF NOT EXISTS idx_audit_booking ON booking_audit_log(booking_id)",
    "CREATE INDEX IF NOT EXISTS idx_charge_attempts_booking ON charge_attempts(booking_id)",
    // Closes the exact-slot commit race: two concurrent creates for the
    // same barber/date/time cannot both land.
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_bookings_slot_unique
     ON bookings(barber, date, time)
     WHERE status != 'cancelled' AND barber IS NOT NULL",
];

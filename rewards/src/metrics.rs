use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};
use std::sync::OnceLock;

static CYCLES_STARTED: OnceLock<IntCounter> = OnceLock::new();
static CYCLES_COMPLETED: OnceLock<IntCounter> = OnceLock::new();
static CYCLES_STOPPED: OnceLock<IntCounter> = OnceLock::new();
static COOLDOWN_RESETS: OnceLock<IntCounter> = OnceLock::new();
static START_REJECTED: OnceLock<IntCounterVec> = OnceLock::new();

static CREDITS_CONFIRMED: OnceLock<IntCounter> = OnceLock::new();
static CREDITS_FAILED: OnceLock<IntCounter> = OnceLock::new();
static STORE_WRITE_FAILURES: OnceLock<IntCounterVec> = OnceLock::new();
static STORE_READ_FAILURES: OnceLock<IntCounterVec> = OnceLock::new();
static NOTIFY_FAILURES: OnceLock<IntCounter> = OnceLock::new();

static ACTIVE_DRIVERS: OnceLock<IntGauge> = OnceLock::new();
static PENDING_CREDITS: OnceLock<IntGauge> = OnceLock::new();

fn cycles_started() -> &'static IntCounter {
    CYCLES_STARTED.get_or_init(|| IntCounter::new("cycles_started_total", "Total mining cycles started").unwrap())
}

fn cycles_completed() -> &'static IntCounter {
    CYCLES_COMPLETED
        .get_or_init(|| IntCounter::new("cycles_completed_total", "Total mining cycles completed").unwrap())
}

fn cycles_stopped() -> &'static IntCounter {
    CYCLES_STOPPED.get_or_init(|| {
        IntCounter::new("cycles_stopped_total", "Total mining cycles cancelled before completion").unwrap()
    })
}

fn cooldown_resets() -> &'static IntCounter {
    COOLDOWN_RESETS
        .get_or_init(|| IntCounter::new("cooldown_resets_total", "Total administrative cooldown resets").unwrap())
}

fn start_rejected() -> &'static IntCounterVec {
    START_REJECTED.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("cycle_start_rejected_total", "Rejected start requests by reason"),
            &["reason"],
        )
        .unwrap()
    })
}

fn credits_confirmed() -> &'static IntCounter {
    CREDITS_CONFIRMED.get_or_init(|| {
        IntCounter::new("credits_confirmed_total", "Cycle credits acknowledged by the balance sink").unwrap()
    })
}

fn credits_failed() -> &'static IntCounter {
    CREDITS_FAILED.get_or_init(|| {
        IntCounter::new("credits_failed_total", "Cycle credit attempts that failed and will be retried").unwrap()
    })
}

fn store_write_failures() -> &'static IntCounterVec {
    STORE_WRITE_FAILURES.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("store_write_failures_total", "Cycle record write failures"),
            &["store"],
        )
        .unwrap()
    })
}

fn store_read_failures() -> &'static IntCounterVec {
    STORE_READ_FAILURES.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("store_read_failures_total", "Cycle record read failures"),
            &["store"],
        )
        .unwrap()
    })
}

fn notify_failures() -> &'static IntCounter {
    NOTIFY_FAILURES
        .get_or_init(|| IntCounter::new("notify_failures_total", "Milestone notifications that failed").unwrap())
}

fn active_drivers() -> &'static IntGauge {
    ACTIVE_DRIVERS
        .get_or_init(|| IntGauge::new("cycle_drivers_active", "Per-user cycle drivers currently running").unwrap())
}

fn pending_credits() -> &'static IntGauge {
    PENDING_CREDITS.get_or_init(|| {
        IntGauge::new("credits_in_flight", "Credit calls currently awaiting the balance sink").unwrap()
    })
}

pub fn inc_cycles_started() {
    cycles_started().inc();
}

pub fn inc_cycles_completed() {
    cycles_completed().inc();
}

pub fn inc_cycles_stopped() {
    cycles_stopped().inc();
}

pub fn inc_cooldown_resets() {
    cooldown_resets().inc();
}

pub fn inc_start_rejected(reason: &str) {
    start_rejected().with_label_values(&[reason]).inc();
}

pub fn inc_credits_confirmed() {
    credits_confirmed().inc();
}

pub fn inc_credits_failed() {
    credits_failed().inc();
}

pub fn inc_store_write_failures(store: &str) {
    store_write_failures().with_label_values(&[store]).inc();
}

pub fn inc_store_read_failures(store: &str) {
    store_read_failures().with_label_values(&[store]).inc();
}

pub fn inc_notify_failures() {
    notify_failures().inc();
}

pub fn inc_active_drivers() {
    active_drivers().inc();
}

pub fn dec_active_drivers() {
    active_drivers().dec();
}

pub fn inc_credits_in_flight() {
    pending_credits().inc();
}

pub fn dec_credits_in_flight() {
    pending_credits().dec();
}

pub fn render() -> String {
    let enc = TextEncoder::new();
    let mut mfs = Vec::new();

    mfs.extend(cycles_started().collect());
    mfs.extend(cycles_completed().collect());
    mfs.extend(cycles_stopped().collect());
    mfs.extend(cooldown_resets().collect());
    mfs.extend(start_rejected().collect());

    mfs.extend(credits_confirmed().collect());
    mfs.extend(credits_failed().collect());
    mfs.extend(store_write_failures().collect());
    mfs.extend(store_read_failures().collect());
    mfs.extend(notify_failures().collect());

    mfs.extend(active_drivers().collect());
    mfs.extend(pending_credits().collect());

    let mut buf = Vec::new();
    let _ = enc.encode(&mfs, &mut buf);
    String::from_utf8_lossy(&buf).to_string()
}

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{Datelike, NaiveDate, NaiveTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for audit timestamps only. Calendar days are `NaiveDate`.
pub type Ms = i64;

/// Prices and fees in minor currency units.
pub type Money = u64;

pub const MINUTES_PER_DAY: u16 = 24 * 60;

// ── Provider identity ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProviderKind {
    IndividualDoctor,
    HospitalDoctor,
    DiagnosticTest,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::IndividualDoctor => "individual_doctor",
            ProviderKind::HospitalDoctor => "hospital_doctor",
            ProviderKind::DiagnosticTest => "diagnostic_test",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "individual_doctor" => Some(ProviderKind::IndividualDoctor),
            "hospital_doctor" => Some(ProviderKind::HospitalDoctor),
            "diagnostic_test" => Some(ProviderKind::DiagnosticTest),
            _ => None,
        }
    }

    /// Hospital doctors and diagnostic tests only exist under an organization.
    pub fn requires_parent(&self) -> bool {
        matches!(self, ProviderKind::HospitalDoctor | ProviderKind::DiagnosticTest)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged provider identity. Every provider kind goes through the same
/// allocation path; the tag only decides which parent linkage is legal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderKey {
    pub kind: ProviderKind,
    pub id: String,
    pub parent_org_id: Option<String>,
}

impl ProviderKey {
    pub fn new(kind: ProviderKind, id: impl Into<String>, parent_org_id: Option<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            parent_org_id,
        }
    }

    pub fn individual(id: impl Into<String>) -> Self {
        Self::new(ProviderKind::IndividualDoctor, id, None)
    }

    pub fn hospital(id: impl Into<String>, hospital_id: impl Into<String>) -> Self {
        Self::new(ProviderKind::HospitalDoctor, id, Some(hospital_id.into()))
    }

    pub fn diagnostic(test_id: impl Into<String>, center_id: impl Into<String>) -> Self {
        Self::new(ProviderKind::DiagnosticTest, test_id, Some(center_id.into()))
    }
}

impl fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.parent_org_id {
            Some(parent) => write!(f, "{}:{}@{}", self.kind, self.id, parent),
            None => write!(f, "{}:{}", self.kind, self.id),
        }
    }
}

// ── Time window ──────────────────────────────────────────────────

/// Minute-of-day window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: u16,
    pub end: u16,
}

impl TimeWindow {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Build from whole hours, e.g. `TimeWindow::hours(9, 17)`.
    pub fn hours(start: u16, end: u16) -> Self {
        Self::new(start * 60, end * 60)
    }

    /// Parse `"HH:MM"` pairs.
    pub fn parse(start: &str, end: &str) -> Option<Self> {
        Some(Self::new(parse_minute_of_day(start)?, parse_minute_of_day(end)?))
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end && self.end <= MINUTES_PER_DAY
    }

    pub fn len_minutes(&self) -> u16 {
        self.end.saturating_sub(self.start)
    }

    pub fn contains(&self, other: &TimeWindow) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// The `serial`-th of `total` equal slices (1-based). Integer minute
    /// arithmetic, so with more slots than minutes some slices are empty.
    pub fn slice(&self, serial: u32, total: u32) -> TimeWindow {
        let total = total.max(1) as u64;
        let idx = (serial.clamp(1, total as u32) - 1) as u64;
        let len = self.len_minutes() as u64;
        let start = self.start as u64 + idx * len / total;
        let end = self.start as u64 + (idx + 1) * len / total;
        TimeWindow::new(start as u16, end as u16)
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", format_minute_of_day(self.start), format_minute_of_day(self.end))
    }
}

pub fn parse_minute_of_day(s: &str) -> Option<u16> {
    let t = NaiveTime::parse_from_str(s.trim(), "%H:%M").ok()?;
    Some((t.hour() * 60 + t.minute()) as u16)
}

pub fn format_minute_of_day(m: u16) -> String {
    format!("{:02}:{:02}", m / 60, m % 60)
}

// ── Weekday set ──────────────────────────────────────────────────

/// Bitmask of weekdays, bit 0 = Monday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AvailableDays(u8);

impl AvailableDays {
    pub const ALL: AvailableDays = AvailableDays(0b0111_1111);
    pub const NONE: AvailableDays = AvailableDays(0);

    pub fn from_weekdays(days: impl IntoIterator<Item = Weekday>) -> Self {
        days.into_iter().fold(Self::NONE, |acc, d| acc.with(d))
    }

    pub fn with(self, day: Weekday) -> Self {
        AvailableDays(self.0 | (1 << day.num_days_from_monday()))
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Parse a comma-separated list such as `"mon,tue,fri"`. `"*"` means every day.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s == "*" {
            return Some(Self::ALL);
        }
        let mut days = Self::NONE;
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            days = days.with(part.parse::<Weekday>().ok()?);
        }
        Some(days)
    }

    pub fn iter(&self) -> impl Iterator<Item = Weekday> + '_ {
        [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ]
        .into_iter()
        .filter(|d| self.contains(*d))
    }
}

impl fmt::Display for AvailableDays {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.iter().map(|d| d.to_string().to_lowercase()).collect();
        f.write_str(&names.join(","))
    }
}

// ── Configuration ────────────────────────────────────────────────

/// Recurring daily capacity for one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSerialConfig {
    pub id: Ulid,
    pub provider: ProviderKey,
    pub total_slots: u32,
    pub window: TimeWindow,
    pub price: Money,
    pub available_days: AvailableDays,
    pub is_active: bool,
}

/// Per-date replacement of a config's capacity, window or price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateOverride {
    pub config_id: Ulid,
    pub date: NaiveDate,
    pub total_slots: Option<u32>,
    pub window: Option<TimeWindow>,
    pub price: Option<Money>,
    pub admin_note: Option<String>,
    /// `false` closes the date entirely.
    pub enabled: bool,
}

impl DateOverride {
    pub fn closed(config_id: Ulid, date: NaiveDate) -> Self {
        Self {
            config_id,
            date,
            total_slots: None,
            window: None,
            price: None,
            admin_note: None,
            enabled: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosureReason {
    /// A date override with `enabled = false`.
    OverrideDisabled,
    /// The weekday is outside the config's available days and no override opens it.
    NotAvailableOnWeekday(Weekday),
}

impl fmt::Display for ClosureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClosureReason::OverrideDisabled => f.write_str("closed by date override"),
            ClosureReason::NotAvailableOnWeekday(d) => write!(f, "provider not available on {d}"),
        }
    }
}

/// Base config merged with any override for one date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveSettings {
    pub config_id: Ulid,
    pub provider: ProviderKey,
    pub date: NaiveDate,
    pub total_slots: u32,
    pub window: TimeWindow,
    pub price: Money,
    pub admin_note: Option<String>,
    pub closure: Option<ClosureReason>,
}

impl EffectiveSettings {
    pub fn is_bookable(&self) -> bool {
        self.closure.is_none()
    }

    /// Number of even serials: `floor(total_slots / 2)`.
    pub fn even_ceiling(&self) -> u32 {
        self.total_slots / 2
    }

    /// Highest serial reachable through self-service.
    pub fn max_self_service_serial(&self) -> u32 {
        self.even_ceiling() * 2
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Accepted,
    Rejected,
    Completed,
    Cancelled,
    NoShow,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Accepted => "accepted",
            BookingStatus::Rejected => "rejected",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::NoShow => "no_show",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "pending" => Some(BookingStatus::Pending),
            "accepted" => Some(BookingStatus::Accepted),
            "rejected" => Some(BookingStatus::Rejected),
            "completed" => Some(BookingStatus::Completed),
            "cancelled" | "canceled" => Some(BookingStatus::Cancelled),
            "no_show" | "noshow" => Some(BookingStatus::NoShow),
            _ => None,
        }
    }

    /// Pending or accepted. Serial uniqueness follows [`BookingStatus::holds_serial`],
    /// which also covers no-shows.
    pub fn is_active(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Accepted)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// Whether the booking keeps its serial off the market. No-shows are
    /// terminal but are not retroactively freed.
    pub fn holds_serial(&self) -> bool {
        self.is_active() || matches!(self, BookingStatus::NoShow)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Actor {
    Patient,
    Provider,
}

impl Actor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Actor::Patient => "patient",
            Actor::Provider => "provider",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "patient" => Some(Actor::Patient),
            "provider" | "staff" | "doctor" => Some(Actor::Provider),
            _ => None,
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which pool a serial came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingSource {
    /// Patient-chosen even serial.
    SelfService,
    /// Staff-assigned odd serial for walk-ins.
    Staff,
}

impl BookingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingSource::SelfService => "self_service",
            BookingSource::Staff => "staff",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub provider: ProviderKey,
    pub date: NaiveDate,
    pub serial: u32,
    pub patient_id: String,
    pub status: BookingStatus,
    pub source: BookingSource,
    pub time_slot: TimeWindow,
    pub fee: Money,
    pub cancelled_by: Option<Actor>,
    pub cancelled_at: Option<Ms>,
    /// Cancellation or rejection reason.
    pub reason: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// Identifies the serial pool for one provider on one date.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DayKey {
    pub provider: ProviderKey,
    pub date: NaiveDate,
}

impl DayKey {
    pub fn new(provider: ProviderKey, date: NaiveDate) -> Self {
        Self { provider, date }
    }

    pub fn weekday(&self) -> Weekday {
        self.date.weekday()
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.provider, self.date)
    }
}

// ── Store state ──────────────────────────────────────────────────

/// A config together with its date overrides.
#[derive(Debug, Clone)]
pub struct ConfigState {
    pub config: ProviderSerialConfig,
    pub overrides: BTreeMap<NaiveDate, DateOverride>,
}

impl ConfigState {
    pub fn new(config: ProviderSerialConfig) -> Self {
        Self {
            config,
            overrides: BTreeMap::new(),
        }
    }
}

/// Every booking ever made for one provider on one date, plus the index of
/// serials currently held. All uniqueness checks read `held`.
#[derive(Debug, Clone)]
pub struct DayLedger {
    pub key: DayKey,
    /// All bookings, terminal ones included, in creation order.
    pub bookings: Vec<Booking>,
    held: BTreeMap<u32, Ulid>,
    positions: HashMap<Ulid, usize>,
}

impl DayLedger {
    pub fn new(key: DayKey) -> Self {
        Self {
            key,
            bookings: Vec::new(),
            held: BTreeMap::new(),
            positions: HashMap::new(),
        }
    }

    pub fn get(&self, id: &Ulid) -> Option<&Booking> {
        self.positions.get(id).map(|&pos| &self.bookings[pos])
    }

    pub fn holder_of(&self, serial: u32) -> Option<Ulid> {
        self.held.get(&serial).copied()
    }

    /// Insert a booking. Returns false (and changes nothing) when the id is
    /// already present or its serial is held by another booking.
    pub fn insert(&mut self, booking: Booking) -> bool {
        if self.positions.contains_key(&booking.id) {
            return false;
        }
        if booking.status.holds_serial() {
            if self.held.contains_key(&booking.serial) {
                return false;
            }
            self.held.insert(booking.serial, booking.id);
        }
        self.positions.insert(booking.id, self.bookings.len());
        self.bookings.push(booking);
        true
    }

    /// Overwrite a booking's status fields and keep the held index in step.
    pub fn set_status(&mut self, id: &Ulid, change: &AppliedStatus) -> Option<&Booking> {
        let pos = *self.positions.get(id)?;
        let booking = &mut self.bookings[pos];
        booking.status = change.status;
        booking.updated_at = change.at;
        if change.status == BookingStatus::Cancelled {
            booking.cancelled_by = Some(change.actor);
            booking.cancelled_at = Some(change.at);
        }
        if change.reason.is_some() {
            booking.reason = change.reason.clone();
        }
        if !booking.status.holds_serial() && self.held.get(&booking.serial) == Some(id) {
            self.held.remove(&booking.serial);
        }
        Some(&self.bookings[pos])
    }
}

/// Status fields written by a lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedStatus {
    pub status: BookingStatus,
    pub actor: Actor,
    pub reason: Option<String>,
    pub at: Ms,
}

/// WAL record format. Flat, one variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ConfigSaved {
        config: ProviderSerialConfig,
    },
    ConfigDeactivated {
        id: Ulid,
        at: Ms,
    },
    OverrideSaved {
        date_override: DateOverride,
    },
    BookingCreated {
        booking: Booking,
    },
    StatusChanged {
        id: Ulid,
        day: DayKey,
        change: AppliedStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn booking(serial: u32, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            provider: ProviderKey::individual("dr-1"),
            date: day(2026, 10, 19),
            serial,
            patient_id: "p-1".into(),
            status,
            source: BookingSource::SelfService,
            time_slot: TimeWindow::hours(9, 10),
            fee: 500,
            cancelled_by: None,
            cancelled_at: None,
            reason: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn applied(status: BookingStatus, actor: Actor) -> AppliedStatus {
        AppliedStatus {
            status,
            actor,
            reason: None,
            at: 42,
        }
    }

    #[test]
    fn time_window_parse_and_display() {
        let w = TimeWindow::parse("09:00", "17:30").unwrap();
        assert_eq!(w, TimeWindow::new(540, 1050));
        assert_eq!(w.to_string(), "09:00-17:30");
        assert!(TimeWindow::parse("9am", "17:00").is_none());
    }

    #[test]
    fn time_window_validity() {
        assert!(TimeWindow::hours(9, 17).is_valid());
        assert!(!TimeWindow::hours(17, 9).is_valid());
        assert!(!TimeWindow::hours(9, 9).is_valid());
    }

    #[test]
    fn slices_partition_the_window() {
        let w = TimeWindow::hours(9, 11); // 120 minutes
        assert_eq!(w.slice(1, 4), TimeWindow::new(540, 570));
        assert_eq!(w.slice(4, 4), TimeWindow::new(630, 660));
        // Contiguous, no gaps
        for n in 1..4 {
            assert_eq!(w.slice(n, 4).end, w.slice(n + 1, 4).start);
        }
    }

    #[test]
    fn available_days_parse() {
        let days = AvailableDays::parse("mon, wed,Fri").unwrap();
        assert!(days.contains(Weekday::Mon));
        assert!(days.contains(Weekday::Fri));
        assert!(!days.contains(Weekday::Tue));
        assert_eq!(days.to_string(), "mon,wed,fri");
        assert_eq!(AvailableDays::parse("*"), Some(AvailableDays::ALL));
        assert!(AvailableDays::parse("funday").is_none());
    }

    #[test]
    fn status_classification() {
        assert!(BookingStatus::Pending.is_active());
        assert!(BookingStatus::Accepted.is_active());
        assert!(BookingStatus::NoShow.is_terminal());
        assert!(BookingStatus::NoShow.holds_serial());
        assert!(!BookingStatus::Cancelled.holds_serial());
        assert!(!BookingStatus::Rejected.holds_serial());
        assert!(!BookingStatus::Completed.holds_serial());
        assert_eq!(BookingStatus::parse("no-show"), Some(BookingStatus::NoShow));
    }

    #[test]
    fn even_ceiling_floors() {
        let s = EffectiveSettings {
            config_id: Ulid::new(),
            provider: ProviderKey::individual("dr-1"),
            date: day(2026, 10, 19),
            total_slots: 7,
            window: TimeWindow::hours(9, 12),
            price: 0,
            admin_note: None,
            closure: None,
        };
        assert_eq!(s.even_ceiling(), 3);
        assert_eq!(s.max_self_service_serial(), 6);
    }

    #[test]
    fn ledger_rejects_second_holder_of_serial() {
        let mut ledger = DayLedger::new(DayKey::new(ProviderKey::individual("dr-1"), day(2026, 10, 19)));
        assert!(ledger.insert(booking(4, BookingStatus::Pending)));
        assert!(!ledger.insert(booking(4, BookingStatus::Pending)));
        assert_eq!(ledger.bookings.len(), 1);
    }

    #[test]
    fn ledger_insert_is_idempotent_by_id() {
        let mut ledger = DayLedger::new(DayKey::new(ProviderKey::individual("dr-1"), day(2026, 10, 19)));
        let b = booking(2, BookingStatus::Pending);
        assert!(ledger.insert(b.clone()));
        assert!(!ledger.insert(b));
        assert_eq!(ledger.bookings.len(), 1);
    }

    #[test]
    fn cancelling_releases_held_serial() {
        let mut ledger = DayLedger::new(DayKey::new(ProviderKey::individual("dr-1"), day(2026, 10, 19)));
        let b = booking(6, BookingStatus::Accepted);
        let id = b.id;
        ledger.insert(b);
        assert_eq!(ledger.holder_of(6), Some(id));

        let updated = ledger
            .set_status(&id, &applied(BookingStatus::Cancelled, Actor::Patient))
            .unwrap();
        assert_eq!(updated.cancelled_by, Some(Actor::Patient));
        assert_eq!(updated.cancelled_at, Some(42));
        assert_eq!(ledger.holder_of(6), None);

        // Terminal booking stays as history
        assert_eq!(ledger.get(&id).unwrap().status, BookingStatus::Cancelled);
    }

    #[test]
    fn no_show_keeps_serial_held() {
        let mut ledger = DayLedger::new(DayKey::new(ProviderKey::individual("dr-1"), day(2026, 10, 19)));
        let b = booking(8, BookingStatus::Accepted);
        let id = b.id;
        ledger.insert(b);
        ledger.set_status(&id, &applied(BookingStatus::NoShow, Actor::Provider));
        assert_eq!(ledger.holder_of(8), Some(id));
    }

    #[test]
    fn provider_key_display() {
        assert_eq!(ProviderKey::individual("d1").to_string(), "individual_doctor:d1");
        assert_eq!(ProviderKey::hospital("d1", "h9").to_string(), "hospital_doctor:d1@h9");
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingCreated {
            booking: booking(2, BookingStatus::Pending),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}

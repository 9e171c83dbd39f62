//! Periodic fraud scoring over reservation and vote history.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::CoreError;
use crate::models::{Reservation, ReservationStatus, Vote};

/// Thresholds for each detection rule. A finding fires when the count reaches the threshold.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnomalyRules {
    pub reservations_24h: u32,
    pub low_confidence_7d: u32,
    pub rejections_7d: u32,
    pub routes_per_travel_date: u32,
}

impl Default for AnomalyRules {
    fn default() -> Self {
        Self {
            reservations_24h: 3,
            low_confidence_7d: 2,
            rejections_7d: 2,
            routes_per_travel_date: 3,
        }
    }
}

/// Typed payload of a finding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnomalyKind {
    #[serde(rename = "multiple_reservations_24h")]
    MultipleReservations24h { reservation_count: u32 },
    MultipleLowConfidence { low_confidence_count: u32 },
    RepeatedRejections { rejected_count: u32 },
    VoteSpread { travel_date: NaiveDate, route_count: u32 },
}

impl AnomalyKind {
    pub const TAGS: [&'static str; 4] = [
        "multiple_reservations_24h",
        "multiple_low_confidence",
        "repeated_rejections",
        "vote_spread",
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            AnomalyKind::MultipleReservations24h { .. } => Self::TAGS[0],
            AnomalyKind::MultipleLowConfidence { .. } => Self::TAGS[1],
            AnomalyKind::RepeatedRejections { .. } => Self::TAGS[2],
            AnomalyKind::VoteSpread { .. } => Self::TAGS[3],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Anomaly {
    pub id: Uuid,
    pub user_id: Uuid,
    pub user_id_hashed: String,
    #[serde(flatten)]
    pub kind: AnomalyKind,
    pub score: f64,
    pub reviewed: bool,
    pub reviewed_by: Option<Uuid>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Anomaly {
    pub fn new(user_id: Uuid, kind: AnomalyKind, score: f64, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            user_id_hashed: hash_user_id(user_id),
            kind,
            score,
            reviewed: false,
            reviewed_by: None,
            reviewed_at: None,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnomalyFilter {
    All,
    Unreviewed,
    Kind(&'static str),
}

impl AnomalyFilter {
    pub fn matches(&self, anomaly: &Anomaly) -> bool {
        match self {
            AnomalyFilter::All => true,
            AnomalyFilter::Unreviewed => !anomaly.reviewed,
            AnomalyFilter::Kind(tag) => anomaly.kind.tag() == *tag,
        }
    }
}

impl FromStr for AnomalyFilter {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "all" => Ok(AnomalyFilter::All),
            "unreviewed" => Ok(AnomalyFilter::Unreviewed),
            other => AnomalyKind::TAGS
                .iter()
                .find(|tag| **tag == other)
                .map(|tag| AnomalyFilter::Kind(*tag))
                .ok_or_else(|| CoreError::Validation(format!("unknown anomaly filter '{}'", other))),
        }
    }
}

/// History the rules run over: reservations created in the lookback window and
/// votes for upcoming travel dates.
#[derive(Debug, Clone, Default)]
pub struct ActivitySnapshot {
    pub reservations: Vec<Reservation>,
    pub votes: Vec<Vote>,
}

pub const LOOKBACK_DAYS: i64 = 7;

pub fn hash_user_id(user_id: Uuid) -> String {
    format!("{:x}", Sha256::digest(user_id.as_bytes()))
}

/// 0.5 at the threshold, +0.1 per extra occurrence, capped at 1.
pub fn score(count: u32, threshold: u32) -> f64 {
    let excess = count.saturating_sub(threshold) as f64;
    (0.5 + 0.1 * excess).min(1.0)
}

/// Apply every rule and return new findings, skipping users that already have an
/// unreviewed finding of the same kind in `open`.
pub fn evaluate(
    snapshot: &ActivitySnapshot,
    rules: &AnomalyRules,
    open: &HashSet<(Uuid, &'static str)>,
    now: DateTime<Utc>,
) -> Vec<Anomaly> {
    let day_ago = now - Duration::hours(24);
    let week_ago = now - Duration::days(LOOKBACK_DAYS);

    let mut recent: HashMap<Uuid, u32> = HashMap::new();
    let mut low_confidence: HashMap<Uuid, u32> = HashMap::new();
    let mut rejected: HashMap<Uuid, u32> = HashMap::new();

    for reservation in snapshot.reservations.iter().filter(|r| r.created_at >= week_ago) {
        let passenger = reservation.passenger_id;
        if reservation.created_at >= day_ago {
            *recent.entry(passenger).or_default() += 1;
        }
        if reservation.low_confidence {
            *low_confidence.entry(passenger).or_default() += 1;
        }
        if reservation.status == ReservationStatus::Rejected {
            *rejected.entry(passenger).or_default() += 1;
        }
    }

    let mut routes: HashMap<(Uuid, NaiveDate), BTreeSet<&str>> = HashMap::new();
    for vote in &snapshot.votes {
        routes
            .entry((vote.passenger_id, vote.travel_date))
            .or_default()
            .insert(vote.route.as_str());
    }

    let mut findings = Vec::new();
    let mut push = |user_id: Uuid, kind: AnomalyKind, count: u32, threshold: u32| {
        if count < threshold || open.contains(&(user_id, kind.tag())) {
            return;
        }
        findings.push(Anomaly::new(user_id, kind, score(count, threshold), now));
    };

    for (user_id, count) in recent {
        push(user_id, AnomalyKind::MultipleReservations24h { reservation_count: count }, count, rules.reservations_24h);
    }
    for (user_id, count) in low_confidence {
        push(user_id, AnomalyKind::MultipleLowConfidence { low_confidence_count: count }, count, rules.low_confidence_7d);
    }
    for (user_id, count) in rejected {
        push(user_id, AnomalyKind::RepeatedRejections { rejected_count: count }, count, rules.rejections_7d);
    }
    for ((user_id, travel_date), route_set) in routes {
        let count = route_set.len() as u32;
        push(user_id, AnomalyKind::VoteSpread { travel_date, route_count: count }, count, rules.routes_per_travel_date);
    }

    // One finding per (user, kind) per pass; vote spread can otherwise fire per date.
    let mut seen = HashSet::new();
    findings.retain(|finding| seen.insert((finding.user_id, finding.kind.tag())));
    findings
}

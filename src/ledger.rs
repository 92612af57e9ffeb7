use crate::errors::AppError;
use crate::model::students::NewLedgerEntry;
use crate::schema::students::dsl as students_dsl;
use diesel::PgConnection;
use diesel::prelude::*;
use serde_json::{Value as JsonValue, json};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Transaction-kind tags recorded on ledger entries.
pub mod txn {
    pub const QUEST_XP_GAIN: &str = "quest_xp_gain";
    pub const QUEST_POINTS_GAIN: &str = "quest_points_gain";
    pub const QUEST_ACADEMIC_GAIN: &str = "quest_academic_gain";
    pub const REVERSAL_QUEST_XP: &str = "reversal_quest_xp";
    pub const REVERSAL_QUEST_POINTS: &str = "reversal_quest_points";
    pub const REVERSAL_QUEST_ACADEMIC: &str = "reversal_quest_academic";
    pub const MANUAL_XP_DEDUCTION: &str = "manual_xp_deduction";
    pub const GUILD_PENALTY: &str = "guild_penalty";
    pub const BADGE_GRANT: &str = "badge_grant";
    pub const MANUAL_ACADEMIC_GAIN: &str = "manual_academic_gain";
    pub const MANUAL_ADJUSTMENT_XP: &str = "manual_adjustment_xp";
    pub const MANUAL_ADJUSTMENT_TOTAL_POINTS: &str = "manual_adjustment_total_points";
    pub const MANUAL_ADJUSTMENT_ACADEMIC_SCORE: &str = "manual_adjustment_academic_score";
}

/// Optional back-reference from a ledger entry to the entity that caused it.
#[derive(Debug, Clone, Copy)]
pub enum EntityRef {
    Student(i64),
    Guild(i64),
    Activity(i64),
    Enrollment(i64),
}

impl EntityRef {
    pub fn kind(&self) -> &'static str {
        match self {
            EntityRef::Student(_) => "student",
            EntityRef::Guild(_) => "guild",
            EntityRef::Activity(_) => "activity",
            EntityRef::Enrollment(_) => "enrollment",
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            EntityRef::Student(id)
            | EntityRef::Guild(id)
            | EntityRef::Activity(id)
            | EntityRef::Enrollment(id) => *id,
        }
    }
}

#[derive(Debug)]
pub struct BadgeTier {
    pub threshold: i32,
    pub name: String,
}

/// Ordered XP-threshold to badge-name table. Loaded once at process start
/// and immutable afterwards; cloning shares the underlying table.
#[derive(Clone, Debug)]
pub struct BadgeTiers {
    tiers: Arc<Vec<BadgeTier>>,
}

impl BadgeTiers {
    pub fn new(mut tiers: Vec<BadgeTier>) -> Self {
        tiers.sort_by_key(|tier| tier.threshold);
        BadgeTiers {
            tiers: Arc::new(tiers),
        }
    }

    /// The production tier table: one badge every 100 XP up to 1000.
    pub fn standard() -> Self {
        let names = [
            (100, "Novice Explorer"),
            (200, "Bronze Explorer"),
            (300, "Silver Pathfinder"),
            (400, "Gold Prospector"),
            (500, "Platinum Soul"),
            (600, "Jasper Archaeologist"),
            (700, "Sapphire Conqueror"),
            (800, "Emerald Conqueror"),
            (900, "Diamond Conqueror"),
            (1000, "Gem Master"),
        ];
        BadgeTiers::new(
            names
                .into_iter()
                .map(|(threshold, name)| BadgeTier {
                    threshold,
                    name: name.to_string(),
                })
                .collect(),
        )
    }

    /// Every tier badge whose threshold is at or below `xp`, in ascending
    /// threshold order. All qualifying tiers are held simultaneously.
    pub fn expected_badges(&self, xp: i32) -> Vec<String> {
        self.tiers
            .iter()
            .take_while(|tier| tier.threshold <= xp)
            .map(|tier| tier.name.clone())
            .collect()
    }
}

pub fn level_for_xp(xp: i32) -> i32 {
    xp / 100 + 1
}

/// Applies a signed XP delta to a student, clamping the result at zero and
/// keeping `level` consistent. Records one ledger entry carrying the
/// *requested* delta (the pre-clamp value, matching the audit convention of
/// the manual-adjustment paths). A zero delta writes nothing.
///
/// Callers must invoke [`recompute_badges`] afterwards, inside the same
/// transaction.
pub fn apply_xp_delta(
    conn: &mut PgConnection,
    student_id: i64,
    delta: i32,
    kind: &str,
    reason: &str,
    reference: Option<EntityRef>,
) -> Result<i32, AppError> {
    let current_xp = students_dsl::students
        .find(student_id)
        .select(students_dsl::xp)
        .first::<i32>(conn)?;

    if delta == 0 {
        debug!("Zero XP delta for student {}, skipping ledger", student_id);
        return Ok(current_xp);
    }

    let new_xp = (current_xp + delta).max(0);
    diesel::update(students_dsl::students.find(student_id))
        .set((
            students_dsl::xp.eq(new_xp),
            students_dsl::level.eq(level_for_xp(new_xp)),
        ))
        .execute(conn)?;

    record_entry(
        conn,
        NewLedgerEntry {
            student_id,
            kind: kind.to_string(),
            xp_delta: delta,
            points_delta: 0.0,
            reason: reason.to_string(),
            entity_kind: reference.map(|r| r.kind().to_string()),
            entity_id: reference.map(|r| r.id()),
        },
    )?;

    debug!(
        "Applied XP delta {} to student {}: {} -> {}",
        delta, student_id, current_xp, new_xp
    );
    Ok(new_xp)
}

/// Applies a signed delta to `total_points`. No floor: reversals may drive
/// the value negative. One ledger entry per nonzero delta.
pub fn apply_total_points_delta(
    conn: &mut PgConnection,
    student_id: i64,
    delta: i32,
    kind: &str,
    reason: &str,
    reference: Option<EntityRef>,
) -> Result<i32, AppError> {
    let current = students_dsl::students
        .find(student_id)
        .select(students_dsl::total_points)
        .first::<i32>(conn)?;

    if delta == 0 {
        return Ok(current);
    }

    let new_total = current + delta;
    diesel::update(students_dsl::students.find(student_id))
        .set(students_dsl::total_points.eq(new_total))
        .execute(conn)?;

    record_entry(
        conn,
        NewLedgerEntry {
            student_id,
            kind: kind.to_string(),
            xp_delta: 0,
            points_delta: delta as f64,
            reason: reason.to_string(),
            entity_kind: reference.map(|r| r.kind().to_string()),
            entity_id: reference.map(|r| r.id()),
        },
    )?;
    Ok(new_total)
}

/// Applies a signed delta to `academic_score`, clamping the result at zero.
/// Records the requested delta, like [`apply_xp_delta`]. One ledger entry
/// per nonzero delta.
pub fn apply_academic_score_delta(
    conn: &mut PgConnection,
    student_id: i64,
    delta: f64,
    kind: &str,
    reason: &str,
    reference: Option<EntityRef>,
) -> Result<f64, AppError> {
    let current = students_dsl::students
        .find(student_id)
        .select(students_dsl::academic_score)
        .first::<f64>(conn)?;

    if delta == 0.0 {
        return Ok(current);
    }

    let new_score = (current + delta).max(0.0);
    diesel::update(students_dsl::students.find(student_id))
        .set(students_dsl::academic_score.eq(new_score))
        .execute(conn)?;

    record_entry(
        conn,
        NewLedgerEntry {
            student_id,
            kind: kind.to_string(),
            xp_delta: 0,
            points_delta: delta,
            reason: reason.to_string(),
            entity_kind: reference.map(|r| r.kind().to_string()),
            entity_id: reference.map(|r| r.id()),
        },
    )?;
    Ok(new_score)
}

/// Replaces the stored badge set with the tier-derived set when the two
/// differ (order-independent comparison). Returns whether a write happened.
pub fn recompute_badges(
    conn: &mut PgConnection,
    tiers: &BadgeTiers,
    student_id: i64,
) -> Result<bool, AppError> {
    let (current_xp, stored_badges) = students_dsl::students
        .find(student_id)
        .select((students_dsl::xp, students_dsl::badges))
        .first::<(i32, JsonValue)>(conn)?;

    let expected = tiers.expected_badges(current_xp);
    let stored_set: HashSet<&str> = stored_badges
        .as_array()
        .map(|array| array.iter().filter_map(JsonValue::as_str).collect())
        .unwrap_or_default();
    let expected_set: HashSet<&str> = expected.iter().map(String::as_str).collect();

    if stored_set == expected_set {
        return Ok(false);
    }

    diesel::update(students_dsl::students.find(student_id))
        .set(students_dsl::badges.eq(json!(expected)))
        .execute(conn)?;

    info!(
        "Badge set for student {} recomputed at {} XP: {:?}",
        student_id, current_xp, expected
    );
    Ok(true)
}

/// Adds a badge to a student's set if not already held. Manual override
/// path, independent of tier derivation. Returns whether the set changed.
pub fn grant_badge(
    conn: &mut PgConnection,
    student_id: i64,
    badge_name: &str,
) -> Result<bool, AppError> {
    let stored_badges = students_dsl::students
        .find(student_id)
        .select(students_dsl::badges)
        .first::<JsonValue>(conn)?;

    let mut badges: Vec<String> = stored_badges
        .as_array()
        .map(|array| {
            array
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default();

    if badges.iter().any(|held| held == badge_name) {
        return Ok(false);
    }

    badges.push(badge_name.to_string());
    diesel::update(students_dsl::students.find(student_id))
        .set(students_dsl::badges.eq(json!(badges)))
        .execute(conn)?;
    Ok(true)
}

/// Appends one immutable ledger entry. `created_at` has a DB default.
pub fn record_entry(conn: &mut PgConnection, entry: NewLedgerEntry) -> Result<(), AppError> {
    diesel::insert_into(crate::schema::ledger_entries::table)
        .values(&entry)
        .execute(conn)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_follows_hundred_xp_steps() {
        assert_eq!(level_for_xp(0), 1);
        assert_eq!(level_for_xp(99), 1);
        assert_eq!(level_for_xp(100), 2);
        assert_eq!(level_for_xp(150), 2);
        assert_eq!(level_for_xp(1000), 11);
    }

    #[test]
    fn expected_badges_holds_every_reached_tier() {
        let tiers = BadgeTiers::standard();
        assert!(tiers.expected_badges(0).is_empty());
        assert!(tiers.expected_badges(99).is_empty());
        assert_eq!(tiers.expected_badges(100), vec!["Novice Explorer"]);
        assert_eq!(
            tiers.expected_badges(250),
            vec!["Novice Explorer", "Bronze Explorer"]
        );
        assert_eq!(tiers.expected_badges(5000).len(), 10);
    }

    #[test]
    fn tier_table_is_sorted_regardless_of_input_order() {
        let tiers = BadgeTiers::new(vec![
            BadgeTier {
                threshold: 200,
                name: "Second".to_string(),
            },
            BadgeTier {
                threshold: 100,
                name: "First".to_string(),
            },
        ]);
        assert_eq!(tiers.expected_badges(250), vec!["First", "Second"]);
    }
}

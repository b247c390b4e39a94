//! Scheduling constraints and the conditions they are tested against.
//!
//! Constraints are a tagged sum type; checking one against a condition
//! yields a [`ConstraintVerdict`] rather than a bare boolean so that
//! "this pairing does not apply" and "nobody can evaluate this yet" stay
//! distinct from "not met".

use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime};
use thiserror::Error;
use tracing::warn;
use xmltree::Element;

use pmoutils::xml::child_elements;

#[derive(Debug, Error)]
pub enum ConstraintError {
    #[error("expected root tag 'constraints', found '{0}'")]
    NotAConstraintsElement(String),
    #[error("date constraint: {0}")]
    Date(String),
    #[error("time constraint: {0}")]
    Time(String),
    #[error("day-of-week constraint: {0}")]
    DayOfWeek(String),
    #[error("priority constraint: {0}")]
    Priority(String),
    #[error("preferred-duration constraint: {0}")]
    PreferredDuration(String),
    #[error("playback constraint: {0}")]
    Playback(String),
}

/// Priority levels, listed lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Lowest,
    Low,
    Medium,
    High,
    Highest,
}

impl Priority {
    pub const ALL: [Priority; 5] = [
        Priority::Lowest,
        Priority::Low,
        Priority::Medium,
        Priority::High,
        Priority::Highest,
    ];

    /// The level assumed for items that carry no priority constraint.
    pub const DEFAULT: Priority = Priority::Medium;

    pub fn from_level(level: &str) -> Option<Priority> {
        match level {
            "lowest" => Some(Priority::Lowest),
            "low" => Some(Priority::Low),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            "highest" => Some(Priority::Highest),
            _ => level
                .parse::<usize>()
                .ok()
                .and_then(|idx| Priority::ALL.get(idx).copied()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Lowest => "lowest",
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Highest => "highest",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOrder {
    Random,
    InOrder,
    ReverseOrder,
}

impl PlaybackOrder {
    fn from_attr(value: &str) -> Option<PlaybackOrder> {
        match value {
            "random" => Some(PlaybackOrder::Random),
            "inorder" => Some(PlaybackOrder::InOrder),
            "reverseorder" => Some(PlaybackOrder::ReverseOrder),
            _ => None,
        }
    }
}

/// A per-weekday time window. `None` means the day is excluded.
pub type DayWindows = [Option<(NaiveTime, NaiveTime)>; 7];

/// One scheduling constraint attached to a CDS node.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    /// Item may play between two dates, both inclusive.
    Date { start: NaiveDate, end: NaiveDate },
    /// Item may play between two times of day, start inclusive, end
    /// exclusive.
    Time { start: NaiveTime, end: NaiveTime },
    /// Item may play within per-weekday time windows (Monday is 0).
    DayOfWeek(DayWindows),
    /// Item plays at the given priority level.
    Priority(Priority),
    /// Preferred playout duration in seconds. Never gates scheduling.
    PreferredDuration(f64),
    /// Playout hints for allocators and schedulers. Never gates.
    Playback {
        order: Option<PlaybackOrder>,
        ratio: Option<f64>,
        avoid_context_switch: Option<bool>,
    },
    /// Output constraints are accepted on the wire but carry no
    /// scheduling semantics here.
    Output,
    /// An unrecognised constraint tag, kept so equality still sees it.
    Unrecognized(String),
}

/// The runtime value a constraint is tested against.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// A moment in time. The filter pipeline uses "now".
    DateTime(NaiveDateTime),
    /// A priority level, used by the priority filter sweep.
    Priority(Priority),
}

/// Outcome of testing a constraint against a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintVerdict {
    Met,
    NotMet,
    /// The condition type does not speak to this constraint (for
    /// example a priority condition against a time constraint).
    NotApplicable,
    /// The pairing would be meaningful but cannot be evaluated (for
    /// example a priority constraint with no condition at all).
    Unimplemented,
}

impl Constraint {
    /// Parse the children of a `<constraints>` element into a list.
    ///
    /// `<scheduling-constraints>` wrappers are flattened; an
    /// `<output-constraints>` child maps to [`Constraint::Output`].
    /// A malformed constraint aborts parsing of the whole element so the
    /// caller can drop the containing node.
    pub fn parse_constraints(elem: &Element) -> Result<Vec<Constraint>, ConstraintError> {
        if elem.name != "constraints" {
            return Err(ConstraintError::NotAConstraintsElement(elem.name.clone()));
        }
        let mut constraints = Vec::new();
        for child in child_elements(elem) {
            if child.name == "scheduling-constraints" {
                for scheduling in child_elements(child) {
                    constraints.push(Constraint::parse_one(scheduling)?);
                }
            } else {
                constraints.push(Constraint::parse_one(child)?);
            }
        }
        Ok(constraints)
    }

    fn parse_one(elem: &Element) -> Result<Constraint, ConstraintError> {
        match elem.name.as_str() {
            "date" => parse_date(elem),
            "time" => parse_time(elem),
            "day-of-week" => parse_day_of_week(elem),
            "priority" => parse_priority(elem),
            "preferred-duration" => parse_preferred_duration(elem),
            "playback" => parse_playback(elem),
            "output-constraints" => Ok(Constraint::Output),
            other => {
                warn!("unrecognised constraint tag '{other}'");
                Ok(Constraint::Unrecognized(other.to_string()))
            }
        }
    }

    /// Test this constraint against a condition. With no condition the
    /// date-like constraints evaluate against the current local time.
    pub fn is_met(&self, condition: Option<&Condition>) -> ConstraintVerdict {
        match self {
            Constraint::Date { start, end } => match datetime_of(condition) {
                Some(now) => {
                    let date = now.date();
                    verdict(date >= *start && date <= *end)
                }
                None => ConstraintVerdict::NotApplicable,
            },
            Constraint::Time { start, end } => match datetime_of(condition) {
                Some(now) => {
                    let time = now.time();
                    verdict(*start <= time && time < *end)
                }
                None => ConstraintVerdict::NotApplicable,
            },
            Constraint::DayOfWeek(windows) => match datetime_of(condition) {
                Some(now) => {
                    let dow = now.date().weekday().num_days_from_monday() as usize;
                    match windows[dow] {
                        Some((start, end)) => {
                            let time = now.time();
                            verdict(start <= time && time < end)
                        }
                        None => ConstraintVerdict::NotMet,
                    }
                }
                None => ConstraintVerdict::NotApplicable,
            },
            Constraint::Priority(level) => match condition {
                Some(Condition::Priority(wanted)) => verdict(level == wanted),
                Some(Condition::DateTime(_)) => ConstraintVerdict::NotApplicable,
                None => ConstraintVerdict::Unimplemented,
            },
            Constraint::PreferredDuration(_)
            | Constraint::Playback { .. }
            | Constraint::Output
            | Constraint::Unrecognized(_) => ConstraintVerdict::Unimplemented,
        }
    }
}

fn verdict(met: bool) -> ConstraintVerdict {
    if met {
        ConstraintVerdict::Met
    } else {
        ConstraintVerdict::NotMet
    }
}

/// Resolve the date-time a date-like constraint should be tested
/// against: the condition when it carries one, "now" when there is no
/// condition at all, `None` when the condition is of another type.
fn datetime_of(condition: Option<&Condition>) -> Option<NaiveDateTime> {
    match condition {
        Some(Condition::DateTime(moment)) => Some(*moment),
        Some(Condition::Priority(_)) => None,
        None => Some(Local::now().naive_local()),
    }
}

/// Check a node's constraints, together with the constraints inherited
/// from its ancestors, against a condition.
///
/// `ignore_unknowns` mirrors the historical behaviour of silently
/// accepting constraints nobody can evaluate. When no constraint was
/// applicable at all and the condition asks for a priority, items fall
/// back to [`Priority::DEFAULT`].
pub fn constraints_are_met(
    chains: &[&[Constraint]],
    condition: Option<&Condition>,
    ignore_unknowns: bool,
) -> bool {
    let mut found_applicable = false;
    for constraints in chains {
        for constraint in *constraints {
            match constraint.is_met(condition) {
                ConstraintVerdict::Met => found_applicable = true,
                ConstraintVerdict::NotMet => return false,
                ConstraintVerdict::NotApplicable => {}
                ConstraintVerdict::Unimplemented => {
                    if !ignore_unknowns {
                        return false;
                    }
                }
            }
        }
    }

    if !found_applicable {
        if let Some(Condition::Priority(wanted)) = condition {
            return *wanted == Priority::DEFAULT;
        }
    }
    true
}

fn between_attrs<'a>(
    elem: &'a Element,
    make_err: fn(String) -> ConstraintError,
) -> Result<(&'a str, &'a str), ConstraintError> {
    let between = elem
        .get_child("between")
        .ok_or_else(|| make_err("expected 'between' tag, not found".into()))?;
    let start = between
        .attributes
        .get("start")
        .map(String::as_str)
        .ok_or_else(|| make_err("'between' tag has no start attribute".into()))?;
    let end = between
        .attributes
        .get("end")
        .map(String::as_str)
        .ok_or_else(|| make_err("'between' tag has no end attribute".into()))?;
    Ok((start, end))
}

fn parse_date(elem: &Element) -> Result<Constraint, ConstraintError> {
    let (start, end) = between_attrs(elem, ConstraintError::Date)?;
    let parse = |s: &str| {
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(|e| ConstraintError::Date(format!("bad date '{s}': {e}")))
    };
    Ok(Constraint::Date {
        start: parse(start)?,
        end: parse(end)?,
    })
}

fn parse_time_of_day(s: &str, make_err: fn(String) -> ConstraintError) -> Result<NaiveTime, ConstraintError> {
    NaiveTime::parse_from_str(s, "%H:%M:%S").map_err(|e| make_err(format!("bad time '{s}': {e}")))
}

fn parse_time(elem: &Element) -> Result<Constraint, ConstraintError> {
    let (start, end) = between_attrs(elem, ConstraintError::Time)?;
    Ok(Constraint::Time {
        start: parse_time_of_day(start, ConstraintError::Time)?,
        end: parse_time_of_day(end, ConstraintError::Time)?,
    })
}

fn weekday_index(name: &str) -> Option<usize> {
    let lower = name.to_ascii_lowercase();
    let idx = match lower.as_str() {
        "monday" | "mon" => 0,
        "tuesday" | "tue" => 1,
        "wednesday" | "wed" => 2,
        "thursday" | "thu" => 3,
        "friday" | "fri" => 4,
        "saturday" | "sat" => 5,
        "sunday" | "sun" => 6,
        _ => return None,
    };
    Some(idx)
}

fn full_day() -> (NaiveTime, NaiveTime) {
    (
        NaiveTime::MIN,
        NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999).unwrap(),
    )
}

/// A `<day-of-week>` element comes in one of two shapes: a single
/// `<between start=mon end=sun/>` covering whole days, or up to seven
/// weekday tags each carrying a `time_start`/`time_end` window, e.g.
/// `<sunday time_start="06:00:00" time_end="19:59:59"/>`.
fn parse_day_of_week(elem: &Element) -> Result<Constraint, ConstraintError> {
    if let Some(between) = elem.get_child("between") {
        let get = |attr: &str| {
            between.attributes.get(attr).ok_or_else(|| {
                ConstraintError::DayOfWeek(format!("'between' tag has no {attr} attribute"))
            })
        };
        let start_day = weekday_index(get("start")?)
            .ok_or_else(|| ConstraintError::DayOfWeek("unknown start weekday".into()))?;
        let end_day = weekday_index(get("end")?)
            .ok_or_else(|| ConstraintError::DayOfWeek("unknown end weekday".into()))?;

        let mut windows: DayWindows = [None; 7];
        for (day, window) in windows.iter_mut().enumerate() {
            let included = if start_day <= end_day {
                day >= start_day && day <= end_day
            } else {
                // Wrapping range, e.g. fri..mon.
                day >= start_day || day <= end_day
            };
            if included {
                *window = Some(full_day());
            }
        }
        return Ok(Constraint::DayOfWeek(windows));
    }

    let mut windows: DayWindows = [None; 7];
    let mut found_weekdays = 0;
    for child in child_elements(elem) {
        let Some(day) = weekday_index(&child.name) else {
            warn!("unrecognised day-of-week child '{}'", child.name);
            continue;
        };
        let get = |attr: &str| {
            child.attributes.get(attr).ok_or_else(|| {
                ConstraintError::DayOfWeek(format!(
                    "weekday tag '{}' has no {attr} attribute",
                    child.name
                ))
            })
        };
        let start = parse_time_of_day(get("time_start")?, ConstraintError::DayOfWeek)?;
        let end = parse_time_of_day(get("time_end")?, ConstraintError::DayOfWeek)?;
        if start >= end {
            return Err(ConstraintError::DayOfWeek(
                "time_start attribute value must be less than time_end attribute value".into(),
            ));
        }
        windows[day] = Some((start, end));
        found_weekdays += 1;
    }

    if found_weekdays == 0 {
        return Err(ConstraintError::DayOfWeek(
            "expected either one 'between' tag or at least one weekday tag".into(),
        ));
    }
    Ok(Constraint::DayOfWeek(windows))
}

fn parse_priority(elem: &Element) -> Result<Constraint, ConstraintError> {
    let level = elem
        .attributes
        .get("level")
        .ok_or_else(|| ConstraintError::Priority("expected level attribute, not found".into()))?;
    Priority::from_level(level)
        .map(Constraint::Priority)
        .ok_or_else(|| ConstraintError::Priority(format!("unrecognised priority level '{level}'")))
}

fn parse_preferred_duration(elem: &Element) -> Result<Constraint, ConstraintError> {
    let text = elem
        .get_text()
        .ok_or_else(|| ConstraintError::PreferredDuration("missing duration text".into()))?;
    let seconds: f64 = text.trim().parse().map_err(|_| {
        ConstraintError::PreferredDuration(format!("could not parse duration '{}'", text.trim()))
    })?;
    Ok(Constraint::PreferredDuration(seconds))
}

/// Ratio values may be written as a percentage (`"25%"`, or any bare
/// number above 1) or as a fraction (`"0.25"`).
fn parse_ratio(raw: &str) -> Result<f64, ConstraintError> {
    let (number, explicit_percent) = match raw.strip_suffix('%') {
        Some(prefix) => (prefix.trim(), true),
        None => (raw.trim(), false),
    };
    let value: f64 = number
        .parse()
        .map_err(|_| ConstraintError::Playback(format!("could not parse ratio attribute '{raw}'")))?;
    let value = value.clamp(0.0, 100.0);
    Ok(if explicit_percent || value > 1.0 {
        value / 100.0
    } else {
        value
    })
}

fn parse_playback(elem: &Element) -> Result<Constraint, ConstraintError> {
    let ratio = match elem.attributes.get("ratio") {
        Some(raw) => Some(parse_ratio(raw)?),
        None => None,
    };
    let order = elem
        .attributes
        .get("order")
        .and_then(|value| PlaybackOrder::from_attr(value));
    let avoid_context_switch = elem
        .attributes
        .get("avoid-context-switch")
        .and_then(|value| value.to_ascii_lowercase().parse::<bool>().ok());
    Ok(Constraint::Playback {
        order,
        ratio,
        avoid_context_switch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmoutils::xml::parse_str;

    fn constraints(xml: &str) -> Vec<Constraint> {
        Constraint::parse_constraints(&parse_str(xml).unwrap()).unwrap()
    }

    fn at(s: &str) -> Condition {
        Condition::DateTime(NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap())
    }

    #[test]
    fn parses_scheduling_constraints_wrapper() {
        let parsed = constraints(
            "<constraints><scheduling-constraints>\
             <priority level='high'/>\
             <preferred-duration>12.5</preferred-duration>\
             </scheduling-constraints></constraints>",
        );
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0], Constraint::Priority(Priority::High));
        assert_eq!(parsed[1], Constraint::PreferredDuration(12.5));
    }

    #[test]
    fn time_window_is_start_inclusive_end_exclusive() {
        let c = &constraints(
            "<constraints><time><between start='08:30:00' end='23:30:00'/></time></constraints>",
        )[0];
        assert_eq!(
            c.is_met(Some(&at("2026-03-02 08:30:00"))),
            ConstraintVerdict::Met
        );
        assert_eq!(
            c.is_met(Some(&at("2026-03-02 23:30:00"))),
            ConstraintVerdict::NotMet
        );
        assert_eq!(
            c.is_met(Some(&at("2026-03-02 08:29:59"))),
            ConstraintVerdict::NotMet
        );
    }

    #[test]
    fn date_window_is_inclusive_both_sides() {
        let c = &constraints(
            "<constraints><date><between start='2026-01-01' end='2026-01-31'/></date></constraints>",
        )[0];
        assert_eq!(
            c.is_met(Some(&at("2026-01-31 12:00:00"))),
            ConstraintVerdict::Met
        );
        assert_eq!(
            c.is_met(Some(&at("2026-02-01 00:00:00"))),
            ConstraintVerdict::NotMet
        );
    }

    #[test]
    fn day_of_week_between_form() {
        let c = &constraints(
            "<constraints><day-of-week><between start='mon' end='fri'/></day-of-week></constraints>",
        )[0];
        // 2026-03-02 is a Monday, 2026-03-07 a Saturday.
        assert_eq!(
            c.is_met(Some(&at("2026-03-02 10:00:00"))),
            ConstraintVerdict::Met
        );
        assert_eq!(
            c.is_met(Some(&at("2026-03-07 10:00:00"))),
            ConstraintVerdict::NotMet
        );
    }

    #[test]
    fn day_of_week_wrapping_between_form() {
        let c = &constraints(
            "<constraints><day-of-week><between start='fri' end='mon'/></day-of-week></constraints>",
        )[0];
        assert_eq!(
            c.is_met(Some(&at("2026-03-08 10:00:00"))), // Sunday
            ConstraintVerdict::Met
        );
        assert_eq!(
            c.is_met(Some(&at("2026-03-04 10:00:00"))), // Wednesday
            ConstraintVerdict::NotMet
        );
    }

    #[test]
    fn day_of_week_weekday_tags() {
        let c = &constraints(
            "<constraints><day-of-week>\
             <sunday time_start='06:00:00' time_end='19:59:59'/>\
             </day-of-week></constraints>",
        )[0];
        assert_eq!(
            c.is_met(Some(&at("2026-03-08 07:00:00"))),
            ConstraintVerdict::Met
        );
        assert_eq!(
            c.is_met(Some(&at("2026-03-08 20:30:00"))),
            ConstraintVerdict::NotMet
        );
        assert_eq!(
            c.is_met(Some(&at("2026-03-09 07:00:00"))), // Monday excluded
            ConstraintVerdict::NotMet
        );
    }

    #[test]
    fn day_of_week_rejects_inverted_window() {
        let err = Constraint::parse_constraints(
            &parse_str(
                "<constraints><day-of-week>\
                 <monday time_start='10:00:00' time_end='09:00:00'/>\
                 </day-of-week></constraints>",
            )
            .unwrap(),
        );
        assert!(err.is_err());
    }

    #[test]
    fn priority_needs_a_priority_condition() {
        let c = &constraints("<constraints><priority level='high'/></constraints>")[0];
        assert_eq!(
            c.is_met(Some(&Condition::Priority(Priority::High))),
            ConstraintVerdict::Met
        );
        assert_eq!(
            c.is_met(Some(&Condition::Priority(Priority::Low))),
            ConstraintVerdict::NotMet
        );
        assert_eq!(c.is_met(None), ConstraintVerdict::Unimplemented);
        assert_eq!(
            c.is_met(Some(&at("2026-03-02 10:00:00"))),
            ConstraintVerdict::NotApplicable
        );
    }

    #[test]
    fn priority_accepts_numeric_levels() {
        let c = &constraints("<constraints><priority level='4'/></constraints>")[0];
        assert_eq!(*c, Constraint::Priority(Priority::Highest));
    }

    #[test]
    fn playback_ratio_spellings() {
        let fraction = &constraints("<constraints><playback ratio='0.25'/></constraints>")[0];
        let percent = &constraints("<constraints><playback ratio='25%'/></constraints>")[0];
        let bare_percent = &constraints("<constraints><playback ratio='25'/></constraints>")[0];
        for c in [fraction, percent, bare_percent] {
            let Constraint::Playback { ratio, .. } = c else {
                panic!("not a playback constraint");
            };
            assert_eq!(*ratio, Some(0.25));
        }
    }

    #[test]
    fn playback_order_and_avoid_context_switch() {
        let c = &constraints(
            "<constraints><playback order='random' avoid-context-switch='False'/></constraints>",
        )[0];
        assert_eq!(
            *c,
            Constraint::Playback {
                order: Some(PlaybackOrder::Random),
                ratio: None,
                avoid_context_switch: Some(false),
            }
        );
    }

    #[test]
    fn unconstrained_item_matches_only_default_priority() {
        let empty: &[Constraint] = &[];
        assert!(constraints_are_met(
            &[empty],
            Some(&Condition::Priority(Priority::Medium)),
            true
        ));
        assert!(!constraints_are_met(
            &[empty],
            Some(&Condition::Priority(Priority::High)),
            true
        ));
    }

    #[test]
    fn inherited_constraints_participate() {
        let parent = constraints(
            "<constraints><time><between start='00:00:00' end='00:00:01'/></time></constraints>",
        );
        let child: Vec<Constraint> = Vec::new();
        let chains: [&[Constraint]; 2] = [&child, &parent];
        let noon = at("2026-03-02 12:00:00");
        assert!(!constraints_are_met(&chains, Some(&noon), true));
    }
}

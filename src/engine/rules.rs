use chrono::NaiveDate;
use tracing::info;
use ulid::Ulid;

use crate::model::*;

use super::availability::{find_rule_overlap, validate_rule};
use super::locks::LockKey;
use super::{ConflictKind, Engine, EngineError};

/// Administrative input for a weekly window; times are `HH:MM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRule {
    pub resource_id: Ulid,
    pub day_of_week: u8,
    pub start_time: String,
    pub end_time: String,
    pub valid_from: Option<NaiveDate>,
    pub valid_to: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleUpdate {
    pub day_of_week: Option<u8>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

impl Engine {
    pub async fn create_availability_rule(&self, req: NewRule) -> Result<AvailabilityRule, EngineError> {
        let rule = AvailabilityRule {
            id: Ulid::new(),
            resource_id: req.resource_id,
            day_of_week: req.day_of_week,
            start_time: WallTime::parse(&req.start_time)?,
            end_time: WallTime::parse(&req.end_time)?,
            valid_from: req.valid_from,
            valid_to: req.valid_to,
            active: true,
        };
        validate_rule(&rule)?;
        if self.resources.get_resource(rule.resource_id).await?.is_none() {
            return Err(EngineError::NotFound {
                entity: "resource",
                id: rule.resource_id,
            });
        }

        let _guard = self.locks.acquire(vec![LockKey::Resource(rule.resource_id)]).await;
        self.ensure_no_rule_overlap(&rule).await?;
        self.rules.insert_rule(&rule).await?;

        info!(rule_id = %rule.id, resource_id = %rule.resource_id, day = rule.day_of_week, start = %rule.start_time, end = %rule.end_time, "availability rule created");
        self.audit(
            None,
            "create",
            "availability_rule",
            rule.id,
            format!(
                "day {} {}-{} on resource {}",
                rule.day_of_week, rule.start_time, rule.end_time, rule.resource_id
            ),
        );
        Ok(rule)
    }

    pub async fn update_availability_rule(
        &self,
        id: Ulid,
        update: RuleUpdate,
    ) -> Result<AvailabilityRule, EngineError> {
        let start_time = update.start_time.as_deref().map(WallTime::parse).transpose()?;
        let end_time = update.end_time.as_deref().map(WallTime::parse).transpose()?;
        self.modify_rule(id, "update", |rule| {
            if let Some(day) = update.day_of_week {
                rule.day_of_week = day;
            }
            if let Some(start) = start_time {
                rule.start_time = start;
            }
            if let Some(end) = end_time {
                rule.end_time = end;
            }
        })
        .await
    }

    pub async fn activate_availability_rule(&self, id: Ulid) -> Result<AvailabilityRule, EngineError> {
        self.modify_rule(id, "activate", |rule| rule.active = true).await
    }

    pub async fn deactivate_availability_rule(&self, id: Ulid) -> Result<AvailabilityRule, EngineError> {
        self.modify_rule(id, "deactivate", |rule| rule.active = false).await
    }

    /// Bound the rule to `[from, to]` (inclusive); `None` leaves that side open.
    pub async fn set_validity_period(
        &self,
        id: Ulid,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<AvailabilityRule, EngineError> {
        self.modify_rule(id, "set_validity", |rule| {
            rule.valid_from = from;
            rule.valid_to = to;
        })
        .await
    }

    pub async fn delete_availability_rule(&self, id: Ulid) -> Result<(), EngineError> {
        let rule = self.load_rule(id).await?;
        let _guard = self.locks.acquire(vec![LockKey::Resource(rule.resource_id)]).await;
        self.rules.delete_rule(id).await?;
        info!(rule_id = %id, resource_id = %rule.resource_id, "availability rule deleted");
        self.audit(
            None,
            "delete",
            "availability_rule",
            id,
            format!("removed from resource {}", rule.resource_id),
        );
        Ok(())
    }

    /// The first active rule of the resource on `day_of_week` overlapping
    /// `[start, end)`, other than `exclude`.
    pub async fn has_rule_overlap(
        &self,
        resource_id: Ulid,
        day_of_week: u8,
        start: WallTime,
        end: WallTime,
        exclude: Option<Ulid>,
    ) -> Result<Option<Ulid>, EngineError> {
        let rules = self.rules.rules_for_resource_day(resource_id, day_of_week).await?;
        Ok(find_rule_overlap(&rules, day_of_week, start, end, exclude).map(|r| r.id))
    }

    async fn ensure_no_rule_overlap(&self, rule: &AvailabilityRule) -> Result<(), EngineError> {
        if !rule.active {
            return Ok(());
        }
        match self
            .has_rule_overlap(
                rule.resource_id,
                rule.day_of_week,
                rule.start_time,
                rule.end_time,
                Some(rule.id),
            )
            .await?
        {
            Some(other) => Err(EngineError::Conflict(ConflictKind::RuleOverlap(other))),
            None => Ok(()),
        }
    }

    /// Load, edit, re-validate and store a rule under its resource lock.
    async fn modify_rule(
        &self,
        id: Ulid,
        action: &'static str,
        edit: impl FnOnce(&mut AvailabilityRule),
    ) -> Result<AvailabilityRule, EngineError> {
        let resource_id = self.load_rule(id).await?.resource_id;
        let _guard = self.locks.acquire(vec![LockKey::Resource(resource_id)]).await;
        let current = self.load_rule(id).await?;

        let mut rule = current.clone();
        edit(&mut rule);
        if rule == current {
            return Ok(current);
        }
        validate_rule(&rule)?;
        self.ensure_no_rule_overlap(&rule).await?;
        self.rules.update_rule(&rule).await?;

        info!(rule_id = %id, resource_id = %rule.resource_id, action, active = rule.active, "availability rule changed");
        self.audit(
            None,
            action,
            "availability_rule",
            id,
            format!(
                "day {} {}-{} valid {:?}..{:?} active={}",
                rule.day_of_week, rule.start_time, rule.end_time, rule.valid_from, rule.valid_to, rule.active
            ),
        );
        Ok(rule)
    }
}

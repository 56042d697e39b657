use chrono::NaiveDate;
use ulid::Ulid;

use crate::clock::{local_day_span, local_instant};
use crate::model::*;

use super::availability::{generate_slots, is_valid_for_date, weekday_of};
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.load_booking(id).await
    }

    pub async fn get_availability_rule(&self, id: Ulid) -> Result<AvailabilityRule, EngineError> {
        self.load_rule(id).await
    }

    pub async fn list_availability_rules(&self, resource_id: Ulid) -> Result<Vec<AvailabilityRule>, EngineError> {
        Ok(self.rules.rules_for_resource(resource_id).await?)
    }

    /// Open slot start times for a resource on a local date: generated from
    /// every rule valid that day, minus slots already taken by open bookings
    /// and slots that are not in the future. Empty for an inactive resource.
    pub async fn list_available_slots(&self, resource_id: Ulid, date: NaiveDate) -> Result<Vec<WallTime>, EngineError> {
        let resource = self
            .resources
            .get_resource(resource_id)
            .await?
            .ok_or(EngineError::NotFound {
                entity: "resource",
                id: resource_id,
            })?;
        if !resource.is_active() {
            return Ok(Vec::new());
        }

        let rules: Vec<AvailabilityRule> = self
            .rules
            .rules_for_resource_day(resource_id, weekday_of(date))
            .await?
            .into_iter()
            .filter(|r| is_valid_for_date(r, date))
            .collect();
        if rules.is_empty() {
            return Ok(Vec::new());
        }

        let taken = self
            .bookings
            .open_bookings_overlapping(resource_id, local_day_span(date, &self.tz), None)
            .await?;
        let now = self.now();

        let mut slots: Vec<WallTime> = rules
            .iter()
            .flat_map(generate_slots)
            .filter(|t| {
                let slot = Span::slot(local_instant(date, *t, &self.tz));
                slot.start > now && !taken.iter().any(|b| b.span.overlaps(&slot))
            })
            .collect();
        slots.sort();
        slots.dedup();
        Ok(slots)
    }
}

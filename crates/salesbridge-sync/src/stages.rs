//! Pipeline stage transitions driven by bookings and sales.

use salesbridge_clients::CrmApi;
use salesbridge_core::{AppointmentStatus, Opportunity, OpportunityUpdate, Stage, StageIds};
use tracing::info;

use crate::error::SyncResult;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StageEvent {
    /// An appointment was booked or changed.
    Booking { no_show: bool },
    /// A collection was recorded. `newly_registered` is the ledger's verdict.
    Sale { amount: f64, newly_registered: bool },
}

impl StageEvent {
    pub fn booking(status: AppointmentStatus) -> Self {
        StageEvent::Booking {
            no_show: status == AppointmentStatus::NoShow,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub from: Stage,
    pub to: Stage,
    pub value_added: f64,
}

impl Transition {
    pub fn stage_changed(&self) -> bool {
        self.from != self.to
    }
}

/// Compute the write for `event`. Booking events never leave a sink stage and never
/// re-enter the stage the opportunity already holds.
pub fn plan(
    stages: &StageIds,
    opportunity: &Opportunity,
    event: StageEvent,
) -> (OpportunityUpdate, Transition) {
    let mut update = opportunity.to_update();
    let from = stages.classify(&opportunity.pipeline_stage_id);
    let mut transition = Transition {
        from,
        to: from,
        value_added: 0.0,
    };

    let target = match event {
        StageEvent::Booking { no_show } => {
            let target = if no_show { Stage::NoShow } else { Stage::Booked };
            (from != target && !from.is_sink()).then_some(target)
        }
        StageEvent::Sale {
            amount,
            newly_registered,
        } => {
            if newly_registered {
                update.monetary_value += amount;
                transition.value_added = amount;
            }
            Some(Stage::Sold)
        }
    };

    if let Some(target) = target {
        if let Some(stage_id) = stages.id_for(target) {
            update.pipeline_stage_id = stage_id.to_string();
            transition.to = target;
        }
    }

    (update, transition)
}

/// Apply `event` to `opportunity`. Issues exactly one CRM update whether or not the stage
/// moves.
pub async fn apply_transition(
    crm: &dyn CrmApi,
    stages: &StageIds,
    opportunity: &Opportunity,
    event: StageEvent,
) -> SyncResult<Transition> {
    let (update, transition) = plan(stages, opportunity, event);
    crm.update_opportunity(&opportunity.id, &update).await?;
    if transition.stage_changed() || transition.value_added != 0.0 {
        info!(
            opportunity_id = %opportunity.id,
            from = ?transition.from,
            to = ?transition.to,
            value_added = transition.value_added,
            "opportunity moved"
        );
    }
    Ok(transition)
}

#[cfg(test)]
mod tests {
    use salesbridge_clients::fake::FakeCrm;

    use super::*;

    fn stages() -> StageIds {
        StageIds {
            new: "st-new".into(),
            booked: "st-booked".into(),
            sold: "st-sold".into(),
            no_show: "st-noshow".into(),
            member: "st-member".into(),
        }
    }

    fn opportunity(stage: &str, value: f64) -> Opportunity {
        Opportunity {
            id: "o-1".into(),
            name: "Jane Doe".into(),
            pipeline_id: "pipe-1".into(),
            pipeline_stage_id: stage.into(),
            status: "open".into(),
            monetary_value: value,
            ..Opportunity::default()
        }
    }

    #[test]
    fn booking_moves_new_to_booked_or_no_show() {
        let (update, transition) = plan(
            &stages(),
            &opportunity("st-new", 0.0),
            StageEvent::booking(AppointmentStatus::Confirmed),
        );
        assert_eq!(update.pipeline_stage_id, "st-booked");
        assert_eq!(transition.to, Stage::Booked);

        let (update, _) = plan(
            &stages(),
            &opportunity("st-new", 0.0),
            StageEvent::booking(AppointmentStatus::NoShow),
        );
        assert_eq!(update.pipeline_stage_id, "st-noshow");
    }

    #[test]
    fn booking_never_leaves_sink_stages() {
        for sink in ["st-sold", "st-member"] {
            let (update, transition) = plan(
                &stages(),
                &opportunity(sink, 50.0),
                StageEvent::booking(AppointmentStatus::Booked),
            );
            assert_eq!(update.pipeline_stage_id, sink);
            assert!(!transition.stage_changed());
            assert_eq!(update.monetary_value, 50.0);
        }
    }

    #[test]
    fn no_show_after_booking_is_a_sideways_move() {
        let (update, transition) = plan(
            &stages(),
            &opportunity("st-booked", 0.0),
            StageEvent::booking(AppointmentStatus::NoShow),
        );
        assert_eq!(update.pipeline_stage_id, "st-noshow");
        assert_eq!(transition.from, Stage::Booked);
    }

    #[test]
    fn sale_adds_value_only_when_newly_registered() {
        let (update, transition) = plan(
            &stages(),
            &opportunity("st-booked", 100.0),
            StageEvent::Sale {
                amount: 45.5,
                newly_registered: true,
            },
        );
        assert_eq!(update.pipeline_stage_id, "st-sold");
        assert_eq!(update.monetary_value, 145.5);
        assert_eq!(transition.value_added, 45.5);

        let (update, transition) = plan(
            &stages(),
            &opportunity("st-sold", 145.5),
            StageEvent::Sale {
                amount: 45.5,
                newly_registered: false,
            },
        );
        assert_eq!(update.monetary_value, 145.5);
        assert_eq!(transition.value_added, 0.0);
    }

    #[test]
    fn unconfigured_target_stage_leaves_stage_alone() {
        let mut partial = stages();
        partial.no_show.clear();
        let (update, transition) = plan(
            &partial,
            &opportunity("st-new", 0.0),
            StageEvent::booking(AppointmentStatus::NoShow),
        );
        assert_eq!(update.pipeline_stage_id, "st-new");
        assert!(!transition.stage_changed());
    }

    #[tokio::test]
    async fn booking_on_sold_still_writes_once() {
        let crm = FakeCrm::new("loc-1");
        let sold = opportunity("st-sold", 80.0);
        crm.seed_opportunity(sold.clone());

        let transition = apply_transition(
            &crm,
            &stages(),
            &sold,
            StageEvent::booking(AppointmentStatus::Booked),
        )
        .await
        .expect("apply");

        assert!(!transition.stage_changed());
        assert_eq!(crm.calls("update_opportunity"), 1);
        let stored = crm.opportunity("o-1").expect("stored");
        assert_eq!(stored.pipeline_stage_id, "st-sold");
        assert_eq!(stored.monetary_value, 80.0);
    }
}

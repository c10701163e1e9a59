//! 日程能力：定会议
//!
//! 会议固定一小时；落库后顺带查同日的其他日程提醒用户。

use std::sync::Arc;

use async_trait::async_trait;

use crate::capability::{mismatched, release_after_error, Handler};
use crate::core::{AssistantError, ResourcePool};
use crate::intent::{Intent, IntentKind};
use crate::providers::{CalendarStore, NewEvent, StoreConn};

pub struct ScheduleMeetingHandler {
    pool: Arc<ResourcePool<Box<dyn StoreConn>>>,
    calendar: Arc<dyn CalendarStore>,
}

impl ScheduleMeetingHandler {
    pub fn new(
        pool: Arc<ResourcePool<Box<dyn StoreConn>>>,
        calendar: Arc<dyn CalendarStore>,
    ) -> Self {
        Self { pool, calendar }
    }
}

#[async_trait]
impl Handler for ScheduleMeetingHandler {
    fn kind(&self) -> IntentKind {
        IntentKind::ScheduleMeeting
    }

    async fn execute(&self, user_id: &str, intent: &Intent) -> Result<String, AssistantError> {
        let Intent::ScheduleMeeting {
            attendee,
            start,
            date_assumed,
        } = intent
        else {
            return Err(mismatched(self.kind()));
        };
        let event = NewEvent {
            user_id: user_id.to_string(),
            title: format!("Meeting with {attendee}"),
            start: *start,
            end: *start + chrono::Duration::hours(1),
            attendee: attendee.clone(),
        };

        let mut conn = self.pool.acquire().await?;
        if let Err(err) = self.calendar.add_event(&mut **conn, &event) {
            release_after_error(conn, &err);
            return Err(err);
        }
        let others = match self.calendar.events_on(&mut **conn, user_id, start.date()) {
            Ok(titles) => titles.len().saturating_sub(1),
            Err(err) => {
                release_after_error(conn, &err);
                return Err(err);
            }
        };

        let mut reply = format!(
            "Scheduled \"{}\" on {} at {}.",
            event.title,
            start.format("%Y-%m-%d"),
            start.format("%H:%M")
        );
        if *date_assumed {
            reply.push_str(" I picked the nearest upcoming day.");
        }
        if others > 0 {
            reply.push_str(&format!(" You have {others} other event(s) that day."));
        }
        Ok(reply)
    }
}

//! Fixed price list for the agent economy

use crate::domain_types::Usdc;
use crate::models::Skill;

/// Granted free on claim
pub const STARTER_SKILL: &str = "event-scout";

pub const EVENT_BOOST_PRICE: Usdc = Usdc::from_micros(100_000);
pub const RECOMMENDATION_PRICE: Usdc = Usdc::from_micros(50_000);

pub static SKILLS: [Skill; 4] = [
    Skill {
        slug: STARTER_SKILL,
        name: "Event Scout",
        description: "Surfaces sessions that match the owner's RSVPs",
        price: Usdc::ZERO,
    },
    Skill {
        slug: "schedule-planner",
        name: "Schedule Planner",
        description: "Builds a conflict-free day plan from saved events",
        price: Usdc::from_micros(300_000),
    },
    Skill {
        slug: "people-finder",
        name: "People Finder",
        description: "Suggests attendees to meet based on shared check-ins",
        price: Usdc::from_micros(250_000),
    },
    Skill {
        slug: "after-party-radar",
        name: "After-Party Radar",
        description: "Tracks side events and late-night meetups",
        price: Usdc::from_micros(500_000),
    },
];

pub fn find_skill(slug: &str) -> Option<&'static Skill> {
    SKILLS.iter().find(|s| s.slug == slug)
}

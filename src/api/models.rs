//! ESI response models
//!
//! Deserialization is tolerant by default: unknown fields are ignored and
//! fields ESI marks optional are `Option`, so an additive upstream change
//! never breaks parsing. Models also serialize, because cached payloads are
//! stored as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tranquility server status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatus {
    pub players: u32,
    pub server_version: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub vip: Option<bool>,
}

/// Public character information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterInfo {
    pub name: String,
    pub corporation_id: i64,
    pub birthday: DateTime<Utc>,
    pub race_id: i32,
    pub bloodline_id: i32,
    #[serde(default)]
    pub alliance_id: Option<i64>,
    #[serde(default)]
    pub security_status: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
}

/// One trained skill
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    pub skill_id: i64,
    pub active_skill_level: i32,
    pub trained_skill_level: i32,
    pub skillpoints_in_skill: i64,
}

/// Trained skills with total skill points
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterSkills {
    pub skills: Vec<Skill>,
    pub total_sp: i64,
    #[serde(default)]
    pub unallocated_sp: Option<i32>,
}

/// One slot in the training queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillQueueEntry {
    pub skill_id: i64,
    pub finished_level: i32,
    pub queue_position: i32,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finish_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub training_start_sp: Option<i32>,
    #[serde(default)]
    pub level_start_sp: Option<i32>,
    #[serde(default)]
    pub level_end_sp: Option<i32>,
}

/// Learning attributes governing training speed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterAttributes {
    pub intelligence: i32,
    pub memory: i32,
    pub perception: i32,
    pub willpower: i32,
    pub charisma: i32,
    #[serde(default)]
    pub bonus_remaps: Option<i32>,
    #[serde(default)]
    pub accrued_remap_cooldown_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_remap_date: Option<DateTime<Utc>>,
}

/// Current ship location; at most one of station/structure is set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterLocation {
    pub solar_system_id: i64,
    #[serde(default)]
    pub station_id: Option<i64>,
    #[serde(default)]
    pub structure_id: Option<i64>,
}

/// Clone state: home station plus jump clones
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterClones {
    #[serde(default)]
    pub home_location: Option<CloneLocation>,
    #[serde(default)]
    pub jump_clones: Vec<JumpClone>,
    #[serde(default)]
    pub last_clone_jump_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneLocation {
    #[serde(default)]
    pub location_id: Option<i64>,
    #[serde(default)]
    pub location_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JumpClone {
    pub jump_clone_id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub location_id: Option<i64>,
    #[serde(default)]
    pub implants: Vec<i64>,
}

/// Mail header from the inbox listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailHeader {
    pub mail_id: i64,
    #[serde(default)]
    pub from: Option<i64>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_read: Option<bool>,
    #[serde(default)]
    pub labels: Vec<i64>,
}

/// One industry job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndustryJob {
    pub job_id: i64,
    pub activity_id: i32,
    pub blueprint_type_id: i64,
    pub status: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    #[serde(default)]
    pub completed_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub runs: Option<i32>,
}

/// Static item type data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniverseType {
    pub type_id: i64,
    pub name: String,
    pub group_id: i64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub published: Option<bool>,
    #[serde(default)]
    pub volume: Option<f64>,
}

/// Static item group data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniverseGroup {
    pub group_id: i64,
    pub name: String,
    pub category_id: i64,
    #[serde(default)]
    pub published: Option<bool>,
    #[serde(default)]
    pub types: Vec<i64>,
}

/// Market price for one type; either price may be absent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketPrice {
    pub type_id: i64,
    #[serde(default)]
    pub average_price: Option<f64>,
    #[serde(default)]
    pub adjusted_price: Option<f64>,
}

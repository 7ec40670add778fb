use chrono::{Datelike, NaiveDate};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Placeholder used in captions when a person has no trigger word
pub const DEFAULT_TRIGGER: &str = "TRIGGER";

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "persons")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub first_name: String,
    pub last_name: String,
    pub ethnicity: String,
    pub gender: String,
    pub birthdate: Option<NaiveDate>,
    pub age: Option<i32>,
    pub trigger_word: Option<String>,
    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::assets::Entity")]
    Assets,
    #[sea_orm(has_many = "super::training_runs::Entity")]
    TrainingRuns,
}

impl Related<super::assets::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Assets.def()
    }
}

impl Related<super::training_runs::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::TrainingRuns.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Age in whole years on `today`, preferring the birthdate over the stored age
    pub fn age_on(&self, today: NaiveDate) -> Option<i32> {
        match self.birthdate {
            Some(birthdate) => {
                let mut age = today.year() - birthdate.year();
                if (today.month(), today.day()) < (birthdate.month(), birthdate.day()) {
                    age -= 1;
                }
                Some(age)
            }
            None => self.age,
        }
    }

    pub fn trigger(&self) -> &str {
        match self.trigger_word.as_deref() {
            Some(trigger) if !trigger.trim().is_empty() => trigger,
            _ => DEFAULT_TRIGGER,
        }
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

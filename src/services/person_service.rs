use chrono::{NaiveDate, Utc};
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, QueryOrder, Set};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::database::entities::persons;
use crate::errors::{LedgerError, LedgerResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPerson {
    pub first_name: String,
    pub last_name: String,
    pub ethnicity: String,
    pub gender: String,
    #[serde(default)]
    pub birthdate: Option<NaiveDate>,
    #[serde(default)]
    pub age: Option<i32>,
    #[serde(default, alias = "trigger")]
    pub trigger_word: Option<String>,
}

#[derive(Clone)]
pub struct PersonService {
    db: DatabaseConnection,
}

impl PersonService {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn create(&self, person: NewPerson) -> LedgerResult<persons::Model> {
        for (field, value) in [
            ("firstName", &person.first_name),
            ("lastName", &person.last_name),
            ("ethnicity", &person.ethnicity),
            ("gender", &person.gender),
        ] {
            if value.trim().is_empty() {
                return Err(LedgerError::Validation(format!("{} must not be empty", field)));
            }
        }
        if matches!(person.age, Some(age) if age < 0) {
            return Err(LedgerError::Validation("age must not be negative".to_string()));
        }

        let now = Utc::now();
        let model = persons::ActiveModel {
            first_name: Set(person.first_name.trim().to_string()),
            last_name: Set(person.last_name.trim().to_string()),
            ethnicity: Set(person.ethnicity.trim().to_string()),
            gender: Set(person.gender.trim().to_string()),
            birthdate: Set(person.birthdate),
            age: Set(person.age),
            trigger_word: Set(person.trigger_word.filter(|t| !t.trim().is_empty())),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&self.db)
        .await?;

        info!("Created person {} ({})", model.id, model.full_name());
        Ok(model)
    }

    pub async fn find(&self, id: i32) -> LedgerResult<Option<persons::Model>> {
        Ok(persons::Entity::find_by_id(id).one(&self.db).await?)
    }

    pub async fn get(&self, id: i32) -> LedgerResult<persons::Model> {
        self.find(id).await?.ok_or(LedgerError::PersonNotFound(id))
    }

    pub async fn list(&self) -> LedgerResult<Vec<persons::Model>> {
        Ok(persons::Entity::find()
            .order_by_asc(persons::Column::Id)
            .all(&self.db)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::setup_database;

    fn new_person() -> NewPerson {
        NewPerson {
            first_name: "Mei".to_string(),
            last_name: "Tanaka".to_string(),
            ethnicity: "asian".to_string(),
            gender: "female".to_string(),
            birthdate: None,
            age: Some(30),
            trigger_word: Some("ZXY".to_string()),
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let db = setup_database(":memory:").await.unwrap();
        let service = PersonService::new(db);

        let created = service.create(new_person()).await.unwrap();
        let fetched = service.get(created.id).await.unwrap();
        assert_eq!(fetched.trigger(), "ZXY");
        assert_eq!(fetched.age, Some(30));
        assert_eq!(service.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_person() {
        let db = setup_database(":memory:").await.unwrap();
        let service = PersonService::new(db);
        let err = service.get(42).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_rejects_blank_gender() {
        let db = setup_database(":memory:").await.unwrap();
        let service = PersonService::new(db);
        let err = service
            .create(NewPerson {
                gender: " ".to_string(),
                ..new_person()
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_FAILED");
    }
}

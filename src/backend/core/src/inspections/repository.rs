//! Persistence for inspections, images, violations and regulations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sqlx::types::Json;
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

use super::model::{
    ImageAnalysisStatus, Inspection, InspectionImage, InspectionStatus, NewViolation, Regulation,
    Violation, ViolationWithRegulations,
};
use crate::ai::BoundingBox;
use crate::error::{InspectorError, Result};

#[async_trait]
pub trait InspectionRepository: Send + Sync {
    async fn get_inspection(&self, id: Uuid) -> Result<Option<Inspection>>;

    async fn update_inspection_status(&self, id: Uuid, status: InspectionStatus) -> Result<()>;

    /// Images of an inspection, optionally filtered by analysis status.
    async fn list_images(
        &self,
        inspection_id: Uuid,
        status: Option<ImageAnalysisStatus>,
    ) -> Result<Vec<InspectionImage>>;

    async fn mark_image_analyzing(&self, image_id: Uuid) -> Result<()>;

    async fn mark_image_completed(&self, image_id: Uuid, tokens_used: i64, cost: f64) -> Result<()>;

    async fn mark_image_failed(&self, image_id: Uuid, error: &str) -> Result<()>;

    async fn insert_violation(&self, violation: NewViolation) -> Result<Violation>;

    /// Regulations whose standard number is in `numbers`.
    async fn find_regulations_by_number(&self, numbers: &[String]) -> Result<Vec<Regulation>>;

    /// Full-text search over regulation titles and bodies, best match first.
    async fn search_regulations(&self, text: &str, limit: i64) -> Result<Vec<(Regulation, f64)>>;

    async fn link_regulation(&self, violation_id: Uuid, regulation_id: Uuid, relevance: f64) -> Result<()>;

    async fn list_violations(&self, inspection_id: Uuid) -> Result<Vec<ViolationWithRegulations>>;
}

/// Lowercased words long enough to be meaningful in a search.
pub(crate) fn search_terms(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.len() >= 4)
        .map(|word| word.to_lowercase())
        .collect();
    terms.sort();
    terms.dedup();
    terms
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Backend
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct Tables {
    inspections: HashMap<Uuid, Inspection>,
    images: HashMap<Uuid, InspectionImage>,
    violations: Vec<Violation>,
    regulations: HashMap<Uuid, Regulation>,
    links: Vec<(Uuid, Uuid, f64)>,
}

/// In-memory repository for tests and local runs.
#[derive(Debug, Default)]
pub struct InMemoryInspectionRepository {
    tables: RwLock<Tables>,
}

impl InMemoryInspectionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_inspection(&self, inspection: Inspection) {
        self.tables.write().inspections.insert(inspection.id, inspection);
    }

    pub fn insert_image(&self, image: InspectionImage) {
        self.tables.write().images.insert(image.id, image);
    }

    pub fn insert_regulation(&self, regulation: Regulation) {
        self.tables.write().regulations.insert(regulation.id, regulation);
    }

    pub fn image(&self, id: Uuid) -> Option<InspectionImage> {
        self.tables.read().images.get(&id).cloned()
    }

    /// Regulation ids linked to a violation.
    pub fn linked_regulations(&self, violation_id: Uuid) -> Vec<Uuid> {
        self.tables
            .read()
            .links
            .iter()
            .filter(|(v, _, _)| *v == violation_id)
            .map(|(_, r, _)| *r)
            .collect()
    }

    fn update_image<F>(&self, image_id: Uuid, update: F) -> Result<()>
    where
        F: FnOnce(&mut InspectionImage),
    {
        let mut tables = self.tables.write();
        let image = tables
            .images
            .get_mut(&image_id)
            .ok_or_else(|| InspectorError::not_found("inspection_image", image_id.to_string()))?;
        update(image);
        Ok(())
    }
}

#[async_trait]
impl InspectionRepository for InMemoryInspectionRepository {
    async fn get_inspection(&self, id: Uuid) -> Result<Option<Inspection>> {
        Ok(self.tables.read().inspections.get(&id).cloned())
    }

    async fn update_inspection_status(&self, id: Uuid, status: InspectionStatus) -> Result<()> {
        let mut tables = self.tables.write();
        let inspection = tables
            .inspections
            .get_mut(&id)
            .ok_or_else(|| InspectorError::inspection_not_found(id))?;
        inspection.status = status;
        inspection.updated_at = Utc::now();
        Ok(())
    }

    async fn list_images(
        &self,
        inspection_id: Uuid,
        status: Option<ImageAnalysisStatus>,
    ) -> Result<Vec<InspectionImage>> {
        let tables = self.tables.read();
        let mut images: Vec<InspectionImage> = tables
            .images
            .values()
            .filter(|image| image.inspection_id == inspection_id)
            .filter(|image| status.map_or(true, |s| image.analysis_status == s))
            .cloned()
            .collect();
        images.sort_by(|a, b| a.storage_key.cmp(&b.storage_key));
        Ok(images)
    }

    async fn mark_image_analyzing(&self, image_id: Uuid) -> Result<()> {
        self.update_image(image_id, |image| {
            image.analysis_status = ImageAnalysisStatus::Analyzing;
            image.analysis_error = None;
        })
    }

    async fn mark_image_completed(&self, image_id: Uuid, tokens_used: i64, cost: f64) -> Result<()> {
        self.update_image(image_id, |image| {
            image.analysis_status = ImageAnalysisStatus::Completed;
            image.tokens_used = Some(tokens_used);
            image.analysis_cost = Some(cost);
            image.analyzed_at = Some(Utc::now());
        })
    }

    async fn mark_image_failed(&self, image_id: Uuid, error: &str) -> Result<()> {
        self.update_image(image_id, |image| {
            image.analysis_status = ImageAnalysisStatus::Failed;
            image.analysis_error = Some(error.to_string());
            image.analyzed_at = Some(Utc::now());
        })
    }

    async fn insert_violation(&self, violation: NewViolation) -> Result<Violation> {
        let stored = Violation {
            id: Uuid::new_v4(),
            inspection_id: violation.inspection_id,
            image_id: violation.image_id,
            description: violation.description,
            location: violation.location,
            bounding_box: violation.bounding_box,
            confidence: violation.confidence,
            category: violation.category,
            severity: violation.severity,
            created_at: Utc::now(),
        };
        self.tables.write().violations.push(stored.clone());
        Ok(stored)
    }

    async fn find_regulations_by_number(&self, numbers: &[String]) -> Result<Vec<Regulation>> {
        let tables = self.tables.read();
        Ok(tables
            .regulations
            .values()
            .filter(|r| numbers.iter().any(|n| n == &r.standard_number))
            .cloned()
            .collect())
    }

    async fn search_regulations(&self, text: &str, limit: i64) -> Result<Vec<(Regulation, f64)>> {
        let terms = search_terms(text);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let tables = self.tables.read();
        let mut scored: Vec<(Regulation, f64)> = tables
            .regulations
            .values()
            .filter_map(|regulation| {
                let haystack = format!("{} {}", regulation.title, regulation.body).to_lowercase();
                let hits = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
                (hits > 0).then(|| (regulation.clone(), hits as f64 / terms.len() as f64))
            })
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(limit.max(0) as usize);
        Ok(scored)
    }

    async fn link_regulation(&self, violation_id: Uuid, regulation_id: Uuid, relevance: f64) -> Result<()> {
        let mut tables = self.tables.write();
        if !tables.regulations.contains_key(&regulation_id) {
            return Err(InspectorError::not_found("regulation", regulation_id.to_string()));
        }
        let exists = tables
            .links
            .iter()
            .any(|(v, r, _)| *v == violation_id && *r == regulation_id);
        if !exists {
            tables.links.push((violation_id, regulation_id, relevance));
        }
        Ok(())
    }

    async fn list_violations(&self, inspection_id: Uuid) -> Result<Vec<ViolationWithRegulations>> {
        let tables = self.tables.read();
        Ok(tables
            .violations
            .iter()
            .filter(|v| v.inspection_id == inspection_id)
            .map(|violation| ViolationWithRegulations {
                violation: violation.clone(),
                regulations: tables
                    .links
                    .iter()
                    .filter(|(v, _, _)| *v == violation.id)
                    .filter_map(|(_, r, _)| tables.regulations.get(r).cloned())
                    .collect(),
            })
            .collect())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PostgreSQL Backend
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, sqlx::FromRow)]
struct InspectionRow {
    id: Uuid,
    user_id: Uuid,
    name: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<InspectionRow> for Inspection {
    type Error = InspectorError;

    fn try_from(row: InspectionRow) -> Result<Self> {
        Ok(Inspection {
            id: row.id,
            user_id: row.user_id,
            name: row.name,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ImageRow {
    id: Uuid,
    inspection_id: Uuid,
    storage_key: String,
    content_type: String,
    analysis_status: String,
    analysis_error: Option<String>,
    tokens_used: Option<i64>,
    analysis_cost: Option<f64>,
    analyzed_at: Option<DateTime<Utc>>,
}

impl TryFrom<ImageRow> for InspectionImage {
    type Error = InspectorError;

    fn try_from(row: ImageRow) -> Result<Self> {
        Ok(InspectionImage {
            id: row.id,
            inspection_id: row.inspection_id,
            storage_key: row.storage_key,
            content_type: row.content_type,
            analysis_status: row.analysis_status.parse()?,
            analysis_error: row.analysis_error,
            tokens_used: row.tokens_used,
            analysis_cost: row.analysis_cost,
            analyzed_at: row.analyzed_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ViolationRow {
    id: Uuid,
    inspection_id: Uuid,
    image_id: Uuid,
    description: String,
    location: String,
    bounding_box: Option<Json<BoundingBox>>,
    confidence: String,
    category: String,
    severity: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<ViolationRow> for Violation {
    type Error = InspectorError;

    fn try_from(row: ViolationRow) -> Result<Self> {
        Ok(Violation {
            id: row.id,
            inspection_id: row.inspection_id,
            image_id: row.image_id,
            description: row.description,
            location: row.location,
            bounding_box: row.bounding_box.map(|b| b.0),
            confidence: row.confidence.parse()?,
            category: row.category,
            severity: row.severity.parse()?,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RegulationRow {
    id: Uuid,
    standard_number: String,
    title: String,
    body: String,
}

impl From<RegulationRow> for Regulation {
    fn from(row: RegulationRow) -> Self {
        Regulation {
            id: row.id,
            standard_number: row.standard_number,
            title: row.title,
            body: row.body,
        }
    }
}

const IMAGE_COLUMNS: &str = "id, inspection_id, storage_key, content_type, analysis_status, \
     analysis_error, tokens_used, analysis_cost, analyzed_at";

const VIOLATION_COLUMNS: &str = "id, inspection_id, image_id, description, location, \
     bounding_box, confidence, category, severity, created_at";

/// PostgreSQL-backed inspection repository.
#[derive(Clone)]
pub struct PgInspectionRepository {
    pool: PgPool,
}

impl PgInspectionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn set_image_status(
        &self,
        image_id: Uuid,
        status: ImageAnalysisStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE inspection_images
            SET analysis_status = $2,
                analysis_error = $3,
                analyzed_at = CASE WHEN $2 = 'failed' THEN NOW() ELSE analyzed_at END
            WHERE id = $1
            "#,
        )
        .bind(image_id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(InspectorError::not_found("inspection_image", image_id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl InspectionRepository for PgInspectionRepository {
    async fn get_inspection(&self, id: Uuid) -> Result<Option<Inspection>> {
        let row = sqlx::query_as::<_, InspectionRow>(
            r#"
            SELECT id, user_id, name, status, created_at, updated_at
            FROM inspections
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Inspection::try_from).transpose()
    }

    async fn update_inspection_status(&self, id: Uuid, status: InspectionStatus) -> Result<()> {
        let result = sqlx::query(
            "UPDATE inspections SET status = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(InspectorError::inspection_not_found(id));
        }
        Ok(())
    }

    async fn list_images(
        &self,
        inspection_id: Uuid,
        status: Option<ImageAnalysisStatus>,
    ) -> Result<Vec<InspectionImage>> {
        let rows = sqlx::query_as::<_, ImageRow>(&format!(
            r#"
            SELECT {IMAGE_COLUMNS}
            FROM inspection_images
            WHERE inspection_id = $1
              AND ($2::TEXT IS NULL OR analysis_status = $2)
            ORDER BY created_at ASC
            "#
        ))
        .bind(inspection_id)
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(InspectionImage::try_from).collect()
    }

    async fn mark_image_analyzing(&self, image_id: Uuid) -> Result<()> {
        self.set_image_status(image_id, ImageAnalysisStatus::Analyzing, None).await
    }

    async fn mark_image_completed(&self, image_id: Uuid, tokens_used: i64, cost: f64) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE inspection_images
            SET analysis_status = 'completed',
                analysis_error = NULL,
                tokens_used = $2,
                analysis_cost = $3,
                analyzed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(image_id)
        .bind(tokens_used)
        .bind(cost)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(InspectorError::not_found("inspection_image", image_id.to_string()));
        }
        Ok(())
    }

    async fn mark_image_failed(&self, image_id: Uuid, error: &str) -> Result<()> {
        self.set_image_status(image_id, ImageAnalysisStatus::Failed, Some(error)).await
    }

    async fn insert_violation(&self, violation: NewViolation) -> Result<Violation> {
        let row = sqlx::query_as::<_, ViolationRow>(&format!(
            r#"
            INSERT INTO violations (id, inspection_id, image_id, description, location,
                                    bounding_box, confidence, category, severity)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {VIOLATION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(violation.inspection_id)
        .bind(violation.image_id)
        .bind(&violation.description)
        .bind(&violation.location)
        .bind(violation.bounding_box.map(Json))
        .bind(violation.confidence.as_str())
        .bind(&violation.category)
        .bind(violation.severity.as_str())
        .fetch_one(&self.pool)
        .await?;

        Violation::try_from(row)
    }

    async fn find_regulations_by_number(&self, numbers: &[String]) -> Result<Vec<Regulation>> {
        if numbers.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, RegulationRow>(
            r#"
            SELECT id, standard_number, title, body
            FROM regulations
            WHERE standard_number = ANY($1)
            "#,
        )
        .bind(numbers)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Regulation::from).collect())
    }

    async fn search_regulations(&self, text: &str, limit: i64) -> Result<Vec<(Regulation, f64)>> {
        // Terms are alphanumeric, so joining them is a safe tsquery
        let terms = search_terms(text);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let query = terms.join(" | ");

        #[derive(sqlx::FromRow)]
        struct RankedRow {
            #[sqlx(flatten)]
            regulation: RegulationRow,
            rank: f32,
        }

        let rows = sqlx::query_as::<_, RankedRow>(
            r#"
            SELECT id, standard_number, title, body,
                   ts_rank(search_vector, to_tsquery('english', $1)) AS rank
            FROM regulations
            WHERE search_vector @@ to_tsquery('english', $1)
            ORDER BY rank DESC
            LIMIT $2
            "#,
        )
        .bind(&query)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| (Regulation::from(row.regulation), f64::from(row.rank)))
            .collect())
    }

    async fn link_regulation(&self, violation_id: Uuid, regulation_id: Uuid, relevance: f64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO violation_regulations (violation_id, regulation_id, relevance)
            VALUES ($1, $2, $3)
            ON CONFLICT (violation_id, regulation_id) DO NOTHING
            "#,
        )
        .bind(violation_id)
        .bind(regulation_id)
        .bind(relevance)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_violations(&self, inspection_id: Uuid) -> Result<Vec<ViolationWithRegulations>> {
        let rows = sqlx::query_as::<_, ViolationRow>(&format!(
            r#"
            SELECT {VIOLATION_COLUMNS}
            FROM violations
            WHERE inspection_id = $1
            ORDER BY created_at ASC
            "#
        ))
        .bind(inspection_id)
        .fetch_all(&self.pool)
        .await?;

        let violations = rows
            .into_iter()
            .map(Violation::try_from)
            .collect::<Result<Vec<_>>>()?;
        let ids: Vec<Uuid> = violations.iter().map(|v| v.id).collect();

        #[derive(sqlx::FromRow)]
        struct LinkRow {
            violation_id: Uuid,
            #[sqlx(flatten)]
            regulation: RegulationRow,
        }

        let links = sqlx::query_as::<_, LinkRow>(
            r#"
            SELECT vr.violation_id, r.id, r.standard_number, r.title, r.body
            FROM violation_regulations vr
            JOIN regulations r ON r.id = vr.regulation_id
            WHERE vr.violation_id = ANY($1)
            ORDER BY vr.relevance DESC
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_violation: HashMap<Uuid, Vec<Regulation>> = HashMap::new();
        for link in links {
            by_violation
                .entry(link.violation_id)
                .or_default()
                .push(Regulation::from(link.regulation));
        }

        Ok(violations
            .into_iter()
            .map(|violation| ViolationWithRegulations {
                regulations: by_violation.remove(&violation.id).unwrap_or_default(),
                violation,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{Confidence, Severity};

    fn violation(inspection_id: Uuid, image_id: Uuid) -> NewViolation {
        NewViolation {
            inspection_id,
            image_id,
            description: "Missing guardrail on open edge".to_string(),
            location: "Level 2".to_string(),
            bounding_box: None,
            confidence: Confidence::High,
            category: "fall_protection".to_string(),
            severity: Severity::Critical,
        }
    }

    #[test]
    fn test_search_terms() {
        assert_eq!(
            search_terms("Worker on the ROOF without harness; roof edge"),
            vec!["edge", "harness", "roof", "without", "worker"]
        );
        assert!(search_terms("a an to").is_empty());
    }

    #[tokio::test]
    async fn test_image_status_transitions() {
        let repo = InMemoryInspectionRepository::new();
        let inspection = Inspection::new(Uuid::new_v4(), "Site");
        let image = InspectionImage::new(inspection.id, "images/1.jpg", "image/jpeg");
        let image_id = image.id;
        repo.insert_inspection(inspection.clone());
        repo.insert_image(image);

        repo.mark_image_analyzing(image_id).await.unwrap();
        assert!(repo
            .list_images(inspection.id, Some(ImageAnalysisStatus::Pending))
            .await
            .unwrap()
            .is_empty());

        repo.mark_image_completed(image_id, 1200, 0.02).await.unwrap();
        let stored = repo.image(image_id).unwrap();
        assert_eq!(stored.analysis_status, ImageAnalysisStatus::Completed);
        assert_eq!(stored.tokens_used, Some(1200));
        assert!(stored.analyzed_at.is_some());

        assert!(repo.mark_image_failed(Uuid::new_v4(), "x").await.is_err());
    }

    #[tokio::test]
    async fn test_regulation_search_and_links() {
        let repo = InMemoryInspectionRepository::new();
        let guardrails = Regulation::new("1926.502(b)", "Guardrail systems", "Top edge height of guardrail");
        let ladders = Regulation::new("1926.1053", "Ladders", "Portable ladder requirements");
        repo.insert_regulation(guardrails.clone());
        repo.insert_regulation(ladders);

        let results = repo.search_regulations("Missing guardrail on edge", 5).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.id, guardrails.id);

        let inspection_id = Uuid::new_v4();
        let stored = repo
            .insert_violation(violation(inspection_id, Uuid::new_v4()))
            .await
            .unwrap();
        repo.link_regulation(stored.id, guardrails.id, 1.0).await.unwrap();
        repo.link_regulation(stored.id, guardrails.id, 1.0).await.unwrap();

        let listed = repo.list_violations(inspection_id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].regulations, vec![guardrails]);
        assert!(repo.link_regulation(stored.id, Uuid::new_v4(), 1.0).await.is_err());
    }
}

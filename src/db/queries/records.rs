//! Fiscal record inserts and reads
//!
//! Inserts take a bare `PgConnection` so they run inside whatever batch
//! transaction (or savepoint) the caller holds.

use std::collections::BTreeMap;

use anyhow::Result;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::types::{
    CommunicationDocument, ConsumptionDocument, Direction, DocumentItem, EnergyDocument,
    MerchandiseDocument, Participant, TransportDocument, RECORD_TABLES,
};

const INSERT_PARTICIPANT: &str = r#"
    INSERT INTO efd_participants (job_id, branch_cnpj, cod_part, name, cod_pais, cnpj, cpf, ie, cod_mun)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
"#;

const INSERT_C100: &str = r#"
    INSERT INTO efd_c100 (job_id, branch_cnpj, direction, ind_emit, cod_part, cod_mod, cod_sit,
        serie, num_doc, chv_nfe, dt_doc, dt_e_s, vl_doc, vl_icms, vl_icms_st, vl_ipi, vl_pis,
        vl_cofins, vl_icms_projected, vl_ibs_projected, vl_cbs_projected)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
    RETURNING id
"#;

const INSERT_C170: &str = r#"
    INSERT INTO efd_c170 (job_id, document_id, branch_cnpj, direction, num_item, cod_item,
        description, quantity, unit, vl_item, vl_desc, cst_icms, cfop, vl_bc_icms, aliq_icms,
        vl_icms, vl_ipi, vl_pis, vl_cofins, vl_icms_projected, vl_ibs_projected, vl_cbs_projected)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)
"#;

const INSERT_C500: &str = r#"
    INSERT INTO efd_c500 (job_id, branch_cnpj, direction, cod_part, cod_mod, cod_sit, num_doc,
        dt_doc, dt_e_s, vl_doc, vl_icms, vl_pis, vl_cofins,
        vl_icms_projected, vl_ibs_projected, vl_cbs_projected)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
"#;

const INSERT_C600: &str = r#"
    INSERT INTO efd_c600 (job_id, branch_cnpj, direction, cod_mod, cod_mun, dt_doc,
        vl_doc, vl_icms, vl_pis, vl_cofins, vl_icms_projected, vl_ibs_projected, vl_cbs_projected)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
"#;

const INSERT_D100: &str = r#"
    INSERT INTO efd_d100 (job_id, branch_cnpj, direction, cod_part, cod_mod, cod_sit, num_doc,
        chv_cte, dt_doc, dt_a_p, vl_doc, vl_icms, vl_pis, vl_cofins,
        vl_icms_projected, vl_ibs_projected, vl_cbs_projected)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 0, 0, $13, $14, $15)
"#;

const INSERT_D500: &str = r#"
    INSERT INTO efd_d500 (job_id, branch_cnpj, direction, cod_part, cod_mod, cod_sit, num_doc,
        dt_doc, dt_a_p, vl_doc, vl_icms, vl_pis, vl_cofins,
        vl_icms_projected, vl_ibs_projected, vl_cbs_projected)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
"#;

/// Statements prepared at the start of every batch transaction
pub const INSERT_STATEMENTS: &[&str] = &[
    INSERT_PARTICIPANT,
    INSERT_C100,
    INSERT_C170,
    INSERT_C500,
    INSERT_C600,
    INSERT_D100,
    INSERT_D500,
];

fn non_empty(value: &str) -> Option<&str> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

// =============================================================================
// INSERTS
// =============================================================================

pub async fn insert_participant(
    conn: &mut PgConnection,
    job_id: Uuid,
    branch_cnpj: &str,
    p: &Participant,
) -> Result<()> {
    sqlx::query(INSERT_PARTICIPANT)
        .bind(job_id)
        .bind(branch_cnpj)
        .bind(&p.cod_part)
        .bind(&p.name)
        .bind(non_empty(&p.cod_pais))
        .bind(non_empty(&p.cnpj))
        .bind(non_empty(&p.cpf))
        .bind(non_empty(&p.ie))
        .bind(non_empty(&p.cod_mun))
        .execute(conn)
        .await?;
    Ok(())
}

/// Insert a `C100` and return its generated id for the items that follow
pub async fn insert_document(
    conn: &mut PgConnection,
    job_id: Uuid,
    branch_cnpj: &str,
    doc: &MerchandiseDocument,
) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(INSERT_C100)
        .bind(job_id)
        .bind(branch_cnpj)
        .bind(doc.direction.code())
        .bind(&doc.ind_emit)
        .bind(&doc.cod_part)
        .bind(&doc.cod_mod)
        .bind(&doc.cod_sit)
        .bind(non_empty(&doc.serie))
        .bind(&doc.num_doc)
        .bind(non_empty(&doc.chv_nfe))
        .bind(doc.dt_doc)
        .bind(doc.dt_e_s)
        .bind(doc.vl_doc)
        .bind(doc.vl_icms)
        .bind(doc.vl_icms_st)
        .bind(doc.vl_ipi)
        .bind(doc.vl_pis)
        .bind(doc.vl_cofins)
        .bind(doc.projected.icms)
        .bind(doc.projected.ibs)
        .bind(doc.projected.cbs)
        .fetch_one(conn)
        .await?;
    Ok(id)
}

pub async fn insert_item(
    conn: &mut PgConnection,
    job_id: Uuid,
    document_id: i64,
    branch_cnpj: &str,
    direction: Direction,
    item: &DocumentItem,
) -> Result<()> {
    sqlx::query(INSERT_C170)
        .bind(job_id)
        .bind(document_id)
        .bind(branch_cnpj)
        .bind(direction.code())
        .bind(&item.num_item)
        .bind(&item.cod_item)
        .bind(non_empty(&item.description))
        .bind(item.quantity)
        .bind(non_empty(&item.unit))
        .bind(item.vl_item)
        .bind(item.vl_desc)
        .bind(non_empty(&item.cst_icms))
        .bind(non_empty(&item.cfop))
        .bind(item.vl_bc_icms)
        .bind(item.aliq_icms)
        .bind(item.vl_icms)
        .bind(item.vl_ipi)
        .bind(item.vl_pis)
        .bind(item.vl_cofins)
        .bind(item.projected.icms)
        .bind(item.projected.ibs)
        .bind(item.projected.cbs)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn insert_energy(
    conn: &mut PgConnection,
    job_id: Uuid,
    branch_cnpj: &str,
    doc: &EnergyDocument,
) -> Result<()> {
    sqlx::query(INSERT_C500)
        .bind(job_id)
        .bind(branch_cnpj)
        .bind(doc.direction.code())
        .bind(&doc.cod_part)
        .bind(&doc.cod_mod)
        .bind(&doc.cod_sit)
        .bind(&doc.num_doc)
        .bind(doc.dt_doc)
        .bind(doc.dt_e_s)
        .bind(doc.vl_doc)
        .bind(doc.vl_icms)
        .bind(doc.vl_pis)
        .bind(doc.vl_cofins)
        .bind(doc.projected.icms)
        .bind(doc.projected.ibs)
        .bind(doc.projected.cbs)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn insert_consumption(
    conn: &mut PgConnection,
    job_id: Uuid,
    branch_cnpj: &str,
    doc: &ConsumptionDocument,
) -> Result<()> {
    sqlx::query(INSERT_C600)
        .bind(job_id)
        .bind(branch_cnpj)
        .bind(Direction::Outbound.code())
        .bind(&doc.cod_mod)
        .bind(non_empty(&doc.cod_mun))
        .bind(doc.dt_doc)
        .bind(doc.vl_doc)
        .bind(doc.vl_icms)
        .bind(doc.vl_pis)
        .bind(doc.vl_cofins)
        .bind(doc.projected.icms)
        .bind(doc.projected.ibs)
        .bind(doc.projected.cbs)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn insert_transport(
    conn: &mut PgConnection,
    job_id: Uuid,
    branch_cnpj: &str,
    doc: &TransportDocument,
) -> Result<()> {
    sqlx::query(INSERT_D100)
        .bind(job_id)
        .bind(branch_cnpj)
        .bind(doc.direction.code())
        .bind(&doc.cod_part)
        .bind(&doc.cod_mod)
        .bind(&doc.cod_sit)
        .bind(&doc.num_doc)
        .bind(non_empty(&doc.chv_cte))
        .bind(doc.dt_doc)
        .bind(doc.dt_a_p)
        .bind(doc.vl_doc)
        .bind(doc.vl_icms)
        .bind(doc.projected.icms)
        .bind(doc.projected.ibs)
        .bind(doc.projected.cbs)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn insert_communication(
    conn: &mut PgConnection,
    job_id: Uuid,
    branch_cnpj: &str,
    doc: &CommunicationDocument,
) -> Result<()> {
    sqlx::query(INSERT_D500)
        .bind(job_id)
        .bind(branch_cnpj)
        .bind(doc.direction.code())
        .bind(&doc.cod_part)
        .bind(&doc.cod_mod)
        .bind(&doc.cod_sit)
        .bind(&doc.num_doc)
        .bind(doc.dt_doc)
        .bind(doc.dt_a_p)
        .bind(doc.vl_doc)
        .bind(doc.vl_icms)
        .bind(doc.vl_pis)
        .bind(doc.vl_cofins)
        .bind(doc.projected.icms)
        .bind(doc.projected.ibs)
        .bind(doc.projected.cbs)
        .execute(conn)
        .await?;
    Ok(())
}

// =============================================================================
// RESUME SUPPORT
// =============================================================================

/// Rows already stored for a job, keyed by record tag
pub async fn count_rows_by_tag(pool: &PgPool, job_id: Uuid) -> Result<BTreeMap<String, u64>> {
    let mut counts = BTreeMap::new();

    for (tag, table) in RECORD_TABLES {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE job_id = $1",
            table
        ))
        .bind(job_id)
        .fetch_one(pool)
        .await?;

        if count > 0 {
            counts.insert(tag.to_string(), count as u64);
        }
    }

    Ok(counts)
}

/// Most recent committed `C100` of a job: the open document at the checkpoint
pub async fn last_document(pool: &PgPool, job_id: Uuid) -> Result<Option<(i64, Direction)>> {
    let row: Option<(i64, String)> = sqlx::query_as(
        "SELECT id, direction FROM efd_c100 WHERE job_id = $1 ORDER BY id DESC LIMIT 1",
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.and_then(|(id, code)| Direction::from_code(&code).map(|direction| (id, direction))))
}

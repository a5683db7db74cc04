use std::collections::BTreeMap;

use anyhow::Context as _;

use crate::config::Clm;
use crate::formats::FlagValue;
use crate::fsutil;
use crate::naming::OutputNaming;
use crate::pipeline::StageContext;

pub const VAULT_CSV_FILE: &str = "VAULT_CSV.csv";

/// Column order of the import sheet.
pub const VAULT_FIELDS: [&str; 21] = [
    "document_id__v",
    "external_id__v",
    "name__v",
    "Type",
    "lifecycle__v",
    "Presentation Link",
    "Fields Only",
    "slide.country__v.name__v",
    "slide.crm_disable_actions__v",
    "slide.crm_media_type__v",
    "slide.filename",
    "slide.product__v.name__v",
    "slide.related_shared_resource__v",
    "slide.related_sub_pres__v",
    "Create Presentation",
    "pres.country__v.name__v",
    "pres.crm_training__v",
    "pres.crm_end_date__v",
    "pres.crm_start_date__v",
    "pres.product__v.name__v",
    "pres.crm_shared_resource__v",
];

const CONTENT_LIFECYCLE: &str = "CRM Content Lifecycle";
const BINDER_LIFECYCLE: &str = "Binder Lifecycle";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultRowType {
    Slide,
    Presentation,
    Shared,
}

impl VaultRowType {
    pub fn as_str(self) -> &'static str {
        match self {
            VaultRowType::Slide => "Slide",
            VaultRowType::Presentation => "Presentation",
            VaultRowType::Shared => "Shared",
        }
    }
}

/// One sheet row. Columns not set serialize as empty cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultRecord {
    pub row_type: VaultRowType,
    fields: BTreeMap<&'static str, String>,
}

impl VaultRecord {
    fn new(row_type: VaultRowType) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("Type", row_type.as_str().to_owned());
        Self { row_type, fields }
    }

    fn set(mut self, column: &'static str, value: impl Into<String>) -> Self {
        debug_assert!(VAULT_FIELDS.contains(&column), "unknown column {column}");
        self.fields.insert(column, value.into());
        self
    }

    pub fn get(&self, column: &str) -> &str {
        self.fields.get(column).map(String::as_str).unwrap_or_default()
    }
}

pub fn records(clm: &Clm, naming: &OutputNaming) -> Vec<VaultRecord> {
    let crm = &clm.crm;
    let product = clm.product.name.clone().unwrap_or_default();
    let shared_resource = crm.shared_resource();

    let mut rows: Vec<VaultRecord> = clm
        .key_messages
        .iter()
        .map(|km| {
            let name = naming.display_name(&km.key_message);
            let id = name.to_lowercase();
            VaultRecord::new(VaultRowType::Slide)
                .set("document_id__v", "")
                .set("external_id__v", id.clone())
                .set("name__v", name)
                .set("lifecycle__v", CONTENT_LIFECYCLE)
                .set("Presentation Link", crm.presentation_id.clone())
                .set("Fields Only", "FALSE")
                .set("slide.country__v.name__v", crm.presentation_country.clone())
                .set("slide.crm_disable_actions__v", "")
                .set("slide.crm_media_type__v", "HTML")
                .set("slide.filename", format!("{id}.zip"))
                .set("slide.product__v.name__v", product.clone())
                .set(
                    "slide.related_shared_resource__v",
                    shared_resource.unwrap_or_default(),
                )
                .set("slide.related_sub_pres__v", "")
        })
        .collect();

    rows.push(
        VaultRecord::new(VaultRowType::Presentation)
            .set("Create Presentation", "FALSE")
            .set("external_id__v", crm.presentation_id.clone())
            .set("lifecycle__v", BINDER_LIFECYCLE)
            .set("name__v", crm.presentation_name.clone())
            .set("pres.country__v.name__v", crm.presentation_country.clone())
            .set(
                "pres.crm_training__v",
                crm.presentation_training
                    .as_ref()
                    .map(FlagValue::to_field)
                    .unwrap_or_default(),
            )
            .set("pres.crm_end_date__v", "")
            .set("pres.crm_start_date__v", "")
            .set("pres.product__v.name__v", product.clone()),
    );

    if let Some(id) = shared_resource {
        rows.push(
            VaultRecord::new(VaultRowType::Shared)
                .set("external_id__v", id)
                .set("Fields Only", "FALSE")
                .set("name__v", id)
                .set("lifecycle__v", CONTENT_LIFECYCLE)
                .set("slide.country__v.name__v", crm.presentation_country.clone())
                .set("slide.crm_media_type__v", "HTML")
                .set("slide.filename", format!("{}.zip", id.replace('-', "_")))
                .set("slide.product__v.name__v", product),
        );
    }

    rows
}

pub fn to_csv(rows: &[VaultRecord]) -> anyhow::Result<String> {
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer
        .write_record(VAULT_FIELDS)
        .context("write csv header")?;
    for row in rows {
        writer
            .write_record(VAULT_FIELDS.iter().map(|column| row.get(column)))
            .with_context(|| format!("write {} row", row.row_type.as_str()))?;
    }
    let bytes = writer.into_inner().context("flush csv")?;
    String::from_utf8(bytes).context("csv is not utf-8")
}

pub fn run(ctx: &StageContext) -> anyhow::Result<()> {
    let rows = records(&ctx.config.clm, &ctx.naming);
    let csv = to_csv(&rows)?;
    let out = ctx.config.deploy_dir().join(VAULT_CSV_FILE);
    fsutil::write_file(&out, csv)?;
    tracing::info!(rows = rows.len(), out = %out.display(), "wrote vault import sheet");
    Ok(())
}

//! Payer directory operations

use async_trait::async_trait;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::debug;

use super::{Database, DbConn};
use crate::aliases::name_tokens;
use crate::error::{Error, Result};
use crate::import::PayerImport;
use crate::matcher::{DirectoryLookup, DirectoryQuery};
use crate::models::{Address, AddressUpdateProposal, NewPayerRequest, PayerDirectoryEntry};

const PAYER_COLUMNS: &str =
    "id, display_name, organization_name, address_line1, city, state, zip, email, phone";

/// Fields written for one payer, whatever their origin
struct PayerFields<'a> {
    display_name: &'a str,
    aliases: &'a [String],
    organization_name: Option<&'a str>,
    address: Option<&'a Address>,
    email: Option<&'a str>,
    phone: Option<&'a str>,
}

impl Database {
    /// Insert or refresh a payer from a directory import
    ///
    /// Rows carrying an id replace the stored payer with that id; rows
    /// without one always create a new payer.
    pub fn insert_payer(&self, payer: &PayerImport) -> Result<String> {
        let mut conn = self.conn()?;
        write_payer(
            &mut conn,
            payer.external_id.as_deref(),
            &PayerFields {
                display_name: &payer.display_name,
                aliases: &payer.aliases,
                organization_name: payer.organization_name.as_deref(),
                address: payer.address.as_ref(),
                email: payer.email.as_deref(),
                phone: payer.phone.as_deref(),
            },
        )
    }

    /// Create a payer from an approved creation proposal
    pub fn create_payer(&self, request: &NewPayerRequest) -> Result<String> {
        let mut conn = self.conn()?;
        let id = write_payer(
            &mut conn,
            None,
            &PayerFields {
                display_name: &request.display_name,
                aliases: &request.aliases,
                organization_name: request.organization_name.as_deref(),
                address: request.address.as_ref(),
                email: request.email.as_deref(),
                phone: request.phone.as_deref(),
            },
        )?;
        debug!(payer = %id, fingerprint = %request.fingerprint, "Created payer from proposal");
        Ok(id)
    }

    pub fn get_payer(&self, id: &str) -> Result<Option<PayerDirectoryEntry>> {
        let conn = self.conn()?;
        load_payer(&conn, id)
    }

    /// All payers in insertion order
    pub fn list_payers(&self) -> Result<Vec<PayerDirectoryEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM payers ORDER BY seq", PAYER_COLUMNS))?;
        let mut payers = stmt
            .query_map([], payer_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for payer in &mut payers {
            payer.aliases = load_aliases(&conn, &payer.id)?;
        }
        Ok(payers)
    }

    pub fn count_payers(&self) -> Result<i64> {
        let conn = self.conn()?;
        conn.query_row("SELECT COUNT(*) FROM payers", [], |row| row.get(0))
            .map_err(Into::into)
    }

    /// Payers sharing at least one name token with the aliases or organization
    pub fn find_payer_candidates(
        &self,
        aliases: &[String],
        organization: Option<&str>,
    ) -> Result<Vec<PayerDirectoryEntry>> {
        let conn = self.conn()?;
        find_candidates(&conn, aliases, organization)
    }

    /// Replace a payer's address
    pub fn set_payer_address(&self, id: &str, address: &Address) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE payers SET address_line1 = ?, city = ?, state = ?, zip = ? WHERE id = ?",
            params![address.line1, address.city, address.state, address.zip, id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("payer {}", id)));
        }
        Ok(())
    }
}

fn write_payer(conn: &mut DbConn, id: Option<&str>, fields: &PayerFields<'_>) -> Result<String> {
    let tx = conn.transaction()?;

    // Imported ids refresh the stored payer; generated ids must be fresh
    let (id, on_conflict) = match id {
        Some(id) => (id.to_string(), UPSERT_PAYER),
        None => (next_payer_id(&tx)?, ""),
    };

    let address = fields.address.cloned().unwrap_or_default();
    tx.execute(
        &format!(
            "INSERT INTO payers (id, display_name, organization_name, address_line1, city, state, zip, email, phone)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?){}",
            on_conflict
        ),
        params![
            id,
            fields.display_name,
            fields.organization_name,
            address.line1,
            address.city,
            address.state,
            address.zip,
            fields.email,
            fields.phone
        ],
    )?;

    tx.execute("DELETE FROM payer_aliases WHERE payer_id = ?", params![id])?;
    tx.execute("DELETE FROM payer_tokens WHERE payer_id = ?", params![id])?;

    for alias in fields.aliases {
        tx.execute(
            "INSERT OR IGNORE INTO payer_aliases (payer_id, alias) VALUES (?, ?)",
            params![id, alias],
        )?;
    }

    let tokens = name_tokens(
        std::iter::once(fields.display_name)
            .chain(fields.aliases.iter().map(String::as_str))
            .chain(fields.organization_name),
    );
    for token in &tokens {
        tx.execute(
            "INSERT OR IGNORE INTO payer_tokens (payer_id, token) VALUES (?, ?)",
            params![id, token],
        )?;
    }

    tx.commit()?;
    Ok(id)
}

const UPSERT_PAYER: &str = "
             ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                organization_name = excluded.organization_name,
                address_line1 = excluded.address_line1,
                city = excluded.city,
                state = excluded.state,
                zip = excluded.zip,
                email = excluded.email,
                phone = excluded.phone";

/// Next `P#####` id not already held by any payer, imported ones included
fn next_payer_id(conn: &Connection) -> Result<String> {
    let mut next: i64 =
        conn.query_row("SELECT COALESCE(MAX(seq), 0) + 1 FROM payers", [], |row| row.get(0))?;
    loop {
        let id = format!("P{:05}", next);
        let taken: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM payers WHERE id = ?)",
            params![id],
            |row| row.get(0),
        )?;
        if !taken {
            return Ok(id);
        }
        next += 1;
    }
}

fn payer_from_row(row: &Row<'_>) -> rusqlite::Result<PayerDirectoryEntry> {
    let address = Address {
        line1: row.get(3)?,
        city: row.get(4)?,
        state: row.get(5)?,
        zip: row.get(6)?,
    };
    Ok(PayerDirectoryEntry {
        id: row.get(0)?,
        display_name: row.get(1)?,
        aliases: Vec::new(),
        organization_name: row.get(2)?,
        address: if address.is_empty() { None } else { Some(address) },
        email: row.get(7)?,
        phone: row.get(8)?,
    })
}

fn load_aliases(conn: &Connection, payer_id: &str) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT alias FROM payer_aliases WHERE payer_id = ? ORDER BY rowid")?;
    let aliases = stmt
        .query_map(params![payer_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(aliases)
}

fn load_payer(conn: &Connection, id: &str) -> Result<Option<PayerDirectoryEntry>> {
    let payer = conn
        .query_row(
            &format!("SELECT {} FROM payers WHERE id = ?", PAYER_COLUMNS),
            params![id],
            payer_from_row,
        )
        .optional()?;
    match payer {
        Some(mut payer) => {
            payer.aliases = load_aliases(conn, &payer.id)?;
            Ok(Some(payer))
        }
        None => Ok(None),
    }
}

fn find_candidates(
    conn: &Connection,
    aliases: &[String],
    organization: Option<&str>,
) -> Result<Vec<PayerDirectoryEntry>> {
    let tokens = name_tokens(aliases.iter().map(String::as_str).chain(organization));
    if tokens.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["?"; tokens.len()].join(", ");
    let sql = format!(
        "SELECT id FROM payers WHERE id IN \
         (SELECT payer_id FROM payer_tokens WHERE token IN ({})) ORDER BY seq",
        placeholders
    );
    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt
        .query_map(params_from_iter(tokens.iter()), |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;

    let mut payers = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(payer) = load_payer(conn, &id)? {
            payers.push(payer);
        }
    }
    Ok(payers)
}

#[async_trait]
impl DirectoryLookup for Database {
    async fn find_candidates(
        &self,
        aliases: &[String],
        organization: Option<&str>,
    ) -> Result<Vec<PayerDirectoryEntry>> {
        self.find_payer_candidates(aliases, organization)
    }

    /// All queries share one pooled connection
    async fn find_candidates_bulk(
        &self,
        queries: &[DirectoryQuery],
    ) -> Result<Vec<Vec<PayerDirectoryEntry>>> {
        let conn = self.conn()?;
        queries
            .iter()
            .map(|query| find_candidates(&conn, &query.aliases, query.organization.as_deref()))
            .collect()
    }

    async fn create_entry(&self, request: &NewPayerRequest) -> Result<String> {
        self.create_payer(request)
    }

    async fn update_address(&self, proposal: &AddressUpdateProposal) -> Result<()> {
        self.set_payer_address(&proposal.payer_directory_id, &proposal.proposed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::parse_payer_csv;

    const PAYERS: &str = "id,name,aliases,organization,address,city,state,zip,email,phone
C-101,Dalene Eimon,D. Eimon,,805 Snead St,Paso Robles,California,93446,dalene@example.com,(805) 555-0142
C-102,Mara Lind,,,12 Vine Ave,Templeton,CA,93465,,
,Harvest Table,,Harvest Table LLC,,,,,,
";

    fn seeded() -> Database {
        let db = Database::in_memory().unwrap();
        for payer in parse_payer_csv(PAYERS.as_bytes()).unwrap() {
            db.insert_payer(&payer).unwrap();
        }
        db
    }

    #[test]
    fn test_import_keeps_external_ids() {
        let db = seeded();
        assert_eq!(db.count_payers().unwrap(), 3);

        let dalene = db.get_payer("C-101").unwrap().unwrap();
        assert_eq!(dalene.display_name, "Dalene Eimon");
        assert_eq!(dalene.address.as_ref().unwrap().state.as_deref(), Some("CA"));
        assert_eq!(dalene.phone.as_deref(), Some("8055550142"));
        assert!(!dalene.aliases.is_empty());

        let listed = db.list_payers().unwrap();
        assert_eq!(listed[2].id, "P00003");
        assert_eq!(listed[2].organization_name.as_deref(), Some("Harvest Table LLC"));
    }

    #[test]
    fn test_reimport_refreshes_instead_of_duplicating() {
        let db = seeded();
        let mut again = parse_payer_csv(PAYERS.as_bytes()).unwrap();
        again[1].email = Some("mara@example.com".into());
        db.insert_payer(&again[1]).unwrap();

        assert_eq!(db.count_payers().unwrap(), 3);
        let mara = db.get_payer("C-102").unwrap().unwrap();
        assert_eq!(mara.email.as_deref(), Some("mara@example.com"));
    }

    #[test]
    fn test_candidates_share_a_name_token() {
        let db = seeded();
        let found = db
            .find_payer_candidates(&["Eimon, D.".to_string()], None)
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "C-101");

        let by_org = db.find_payer_candidates(&[], Some("Harvest Table")).unwrap();
        assert_eq!(by_org.len(), 1);

        assert!(db.find_payer_candidates(&["Zed Q".to_string()], None).unwrap().is_empty());
        assert!(db.find_payer_candidates(&[], None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bulk_lookup_is_positional() {
        let db = seeded();
        let results = db
            .find_candidates_bulk(&[
                DirectoryQuery {
                    aliases: vec!["Mara Lind".into()],
                    organization: None,
                },
                DirectoryQuery {
                    aliases: vec!["Nobody Here".into()],
                    organization: None,
                },
                DirectoryQuery {
                    aliases: vec!["Dalene Eimon".into()],
                    organization: None,
                },
            ])
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0][0].id, "C-102");
        assert!(results[1].is_empty());
        assert_eq!(results[2][0].id, "C-101");
    }

    #[tokio::test]
    async fn test_create_and_update_through_directory_trait() {
        let db = Database::in_memory().unwrap();
        let id = db
            .create_entry(&NewPayerRequest {
                fingerprint: "pay_1".into(),
                display_name: "Ana Ruiz".into(),
                aliases: vec!["Ana Ruiz".into(), "Ruiz, Ana".into()],
                organization_name: None,
                salutation: Some("Dr.".into()),
                address: None,
                email: None,
                phone: None,
            })
            .await
            .unwrap();
        assert_eq!(id, "P00001");

        let proposed = Address {
            line1: Some("4 Oak Ct".into()),
            city: Some("Atascadero".into()),
            state: Some("CA".into()),
            zip: Some("93422".into()),
        };
        db.update_address(&AddressUpdateProposal {
            fingerprint: "pay_1".into(),
            payer_directory_id: id.clone(),
            current: None,
            proposed: proposed.clone(),
            differing_fields: vec!["line1".into()],
        })
        .await
        .unwrap();
        assert_eq!(db.get_payer(&id).unwrap().unwrap().address, Some(proposed));

        let found = db.find_candidates(&["Ruiz".into()], None).await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_created_payer_skips_imported_ids() {
        let db = Database::in_memory().unwrap();
        let mut imported = parse_payer_csv(PAYERS.as_bytes()).unwrap();
        imported[1].external_id = Some("P00002".into());
        db.insert_payer(&imported[1]).unwrap();

        let first = db.insert_payer(&imported[2]).unwrap();
        assert_eq!(first, "P00003");

        let created = db
            .create_payer(&NewPayerRequest {
                fingerprint: "pay_2".into(),
                display_name: "Ana Ruiz".into(),
                aliases: vec!["Ana Ruiz".into()],
                organization_name: None,
                salutation: None,
                address: None,
                email: None,
                phone: None,
            })
            .unwrap();
        assert_ne!(created, "P00002");
        assert_ne!(created, "P00003");
        assert_eq!(db.count_payers().unwrap(), 3);

        let mara = db.get_payer("P00002").unwrap().unwrap();
        assert_eq!(mara.display_name, "Mara Lind");
    }

    #[test]
    fn test_update_missing_payer_is_not_found() {
        let db = Database::in_memory().unwrap();
        let err = db
            .set_payer_address("C-404", &Address::default())
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}

use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};

use crate::character::{Character, EngagedMonster};
use crate::combat::RoundResult;
use crate::error::CombatError;

pub struct Database {
    pool: SqlitePool,
}

/// New character defaults
#[derive(Debug, Clone)]
pub struct NewCharacter<'a> {
    pub name: &'a str,
    pub max_hp: i32,
    pub max_mana: i32,
    pub level: i32,
    pub current_map_id: Option<i64>,
}

const CHARACTER_COLUMNS: &str = "id, name, hp, max_hp, mana, max_mana, level, exp, gold, \
     current_map_id, is_fighting, combat_monsters_json, monsters_spawned_at";

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        // Run migrations
        Self::migrate(&pool).await?;

        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS characters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                hp INTEGER NOT NULL DEFAULT 100,
                max_hp INTEGER NOT NULL DEFAULT 100,
                mana INTEGER NOT NULL DEFAULT 50,
                max_mana INTEGER NOT NULL DEFAULT 50,
                level INTEGER NOT NULL DEFAULT 1,
                exp INTEGER NOT NULL DEFAULT 0,
                gold INTEGER NOT NULL DEFAULT 0,
                current_map_id INTEGER,
                is_fighting INTEGER NOT NULL DEFAULT 0,
                combat_monsters_json TEXT,
                monsters_spawned_at INTEGER,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS combat_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                character_id INTEGER NOT NULL,
                map_id INTEGER,
                outcome TEXT NOT NULL,
                damage_dealt INTEGER NOT NULL DEFAULT 0,
                damage_taken INTEGER NOT NULL DEFAULT 0,
                exp_gained INTEGER NOT NULL DEFAULT 0,
                gold_gained INTEGER NOT NULL DEFAULT 0,
                loot_json TEXT NOT NULL DEFAULT '[]',
                skill_ids_json TEXT NOT NULL DEFAULT '[]',
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY(character_id) REFERENCES characters(id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_characters_fighting ON characters(is_fighting)",
        )
        .execute(pool)
        .await?;

        tracing::info!("Database migrations complete");
        Ok(())
    }

    pub async fn create_character(&self, new: NewCharacter<'_>) -> Result<Character, CombatError> {
        let result = sqlx::query(
            r#"INSERT INTO characters (name, hp, max_hp, mana, max_mana, level, exp, current_map_id)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(new.name)
        .bind(new.max_hp)
        .bind(new.max_hp)
        .bind(new.max_mana)
        .bind(new.max_mana)
        .bind(new.level)
        .bind(crate::skills::total_xp_for_level(new.level))
        .bind(new.current_map_id)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        tracing::info!("Created character: {} (id: {})", new.name, id);

        self.get_character(id)
            .await?
            .ok_or(CombatError::CharacterNotFound(id))
    }

    pub async fn get_character(&self, id: i64) -> Result<Option<Character>, CombatError> {
        let sql = format!("SELECT {} FROM characters WHERE id = ?", CHARACTER_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| character_from_row(&r)).transpose()
    }

    /// All characters currently flagged as fighting
    pub async fn list_fighting_characters(&self) -> Result<Vec<Character>, CombatError> {
        let sql = format!(
            "SELECT {} FROM characters WHERE is_fighting = 1 ORDER BY id",
            CHARACTER_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        rows.iter().map(character_from_row).collect()
    }

    pub async fn set_fighting(&self, id: i64, fighting: bool) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE characters SET is_fighting = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(fighting)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Persist the fields a combat round can change.
    ///
    /// The fighting flag is written separately through `set_fighting`, so a
    /// round never re-raises a flag that a concurrent stop just cleared.
    pub async fn save_combat_state(&self, character: &Character) -> Result<(), CombatError> {
        let monsters_json = character
            .combat_monsters
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"UPDATE characters SET
                hp = ?, mana = ?, level = ?, exp = ?, gold = ?,
                combat_monsters_json = ?, monsters_spawned_at = ?,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = ?"#,
        )
        .bind(character.hp)
        .bind(character.mana)
        .bind(character.level)
        .bind(character.exp)
        .bind(character.gold)
        .bind(monsters_json)
        .bind(character.monsters_spawned_at)
        .bind(character.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn set_map(&self, id: i64, map_id: Option<i64>) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE characters SET current_map_id = ? WHERE id = ?")
            .bind(map_id)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Append one resolved round to the combat log
    pub async fn append_combat_log(
        &self,
        character: &Character,
        round: &RoundResult,
        skill_ids: &[u32],
    ) -> Result<(), CombatError> {
        let loot_json = serde_json::to_string(&round.loot)?;
        let skills_json = serde_json::to_string(skill_ids)?;

        sqlx::query(
            r#"INSERT INTO combat_logs
                (character_id, map_id, outcome, damage_dealt, damage_taken,
                 exp_gained, gold_gained, loot_json, skill_ids_json)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(character.id)
        .bind(character.current_map_id)
        .bind(round.outcome.as_str())
        .bind(round.damage_dealt)
        .bind(round.damage_taken)
        .bind(round.exp_gained)
        .bind(round.gold_gained)
        .bind(loot_json)
        .bind(skills_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn count_combat_logs(&self, character_id: i64) -> Result<i64, sqlx::Error> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM combat_logs WHERE character_id = ?")
            .bind(character_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.get("n"))
    }
}

fn character_from_row(r: &SqliteRow) -> Result<Character, CombatError> {
    let monsters_json: Option<String> = r.get("combat_monsters_json");
    let combat_monsters = monsters_json
        .map(|json| serde_json::from_str::<Vec<EngagedMonster>>(&json))
        .transpose()?;

    Ok(Character {
        id: r.get("id"),
        name: r.get("name"),
        hp: r.get("hp"),
        max_hp: r.get("max_hp"),
        mana: r.get("mana"),
        max_mana: r.get("max_mana"),
        level: r.get("level"),
        exp: r.get("exp"),
        gold: r.get("gold"),
        current_map_id: r.get("current_map_id"),
        is_fighting: r.get("is_fighting"),
        combat_monsters,
        monsters_spawned_at: r.get("monsters_spawned_at"),
    })
}

/// File-backed database in a temp dir; the dir must outlive the database.
#[cfg(test)]
pub(crate) async fn test_database() -> (tempfile::TempDir, Database) {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let url = format!("sqlite:{}?mode=rwc", temp_dir.path().join("test.db").display());
    let db = Database::new(&url).await.unwrap();
    (temp_dir, db)
}

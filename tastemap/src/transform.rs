use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use serde::Deserialize;

use crate::error::TransformError;

/// The five borough names, in id order. `B1`..`B5` are derived from this
/// ordering, so reordering the constant changes every stored foreign key.
pub const BOROUGHS: [&str; 5] = ["Manhattan", "Bronx", "Brooklyn", "Queens", "Staten Island"];

/// Cuisine categories kept in the fact table, in id order (`C1`..`C53`).
/// Same stability caveat as [`BOROUGHS`]: ids are positional.
pub const CUISINES: [&str; 53] = [
    "Afghan",
    "African",
    "Armenian",
    "Australian",
    "Bangladeshi",
    "Basque",
    "Brazilian",
    "Cajun",
    "Californian",
    "Caribbean",
    "Chilean",
    "Chinese",
    "Chinese/Japanese",
    "Creole",
    "Creole/Cajun",
    "Czech",
    "Eastern European",
    "Egyptian",
    "English",
    "Ethiopian",
    "Filipino",
    "French",
    "German",
    "Greek",
    "Haute Cuisine",
    "Hawaiian",
    "Indian",
    "Indonesian",
    "Iranian",
    "Irish",
    "Italian",
    "Japanese",
    "Jewish/Kosher",
    "Korean",
    "Latin American",
    "Lebanese",
    "Mediterranean",
    "Mexican",
    "Middle Eastern",
    "Moroccan",
    "New French",
    "Pakistani",
    "Peruvian",
    "Polish",
    "Portuguese",
    "Russian",
    "Scandinavian",
    "Soul Food",
    "Southeast Asian",
    "Spanish",
    "Tapas",
    "Thai",
    "Turkish",
];

/// One row as returned by the inspections dataset, before any cleaning.
/// Field names match the aliases in the `$select` projection.
#[derive(Debug, Clone, Deserialize)]
pub struct RawInspection {
    pub id: i64,
    pub name: String,
    pub borough: String,
    pub cuisine: String,
    pub inspection_date: String,
    pub lat: f64,
    pub lng: f64,
}

/// A cleaned restaurant record: one row per location, most recent
/// inspection only, category values still denormalized.
#[derive(Debug, Clone, PartialEq)]
pub struct Restaurant {
    pub id: i64,
    pub name: String,
    pub borough: String,
    pub cuisine: String,
    pub inspection_date: NaiveDate,
    pub lat: f64,
    pub lng: f64,
}

/// A fact row ready for loading: category values replaced with surrogate
/// codes referencing the dimension tables.
#[derive(Debug, Clone, PartialEq)]
pub struct FactRow {
    pub id: i64,
    pub name: String,
    pub borough_id: String,
    pub cuisine_id: String,
    pub inspection_date: NaiveDate,
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoroughRow {
    pub borough_id: String,
    pub borough: String,
    pub population: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CuisineRow {
    pub cuisine_id: String,
    pub cuisine: String,
}

/// Build a name -> surrogate code map by enumerating a fixed reference
/// sequence, 1-based. The mapping is deterministic for a given sequence,
/// which is what keeps dimension ids stable across full rebuilds.
pub fn create_dict<F>(reference: &[&str], translate: F) -> HashMap<String, String>
where
    F: Fn(usize) -> String,
{
    reference
        .iter()
        .enumerate()
        .map(|(idx, name)| ((*name).to_owned(), translate(idx + 1)))
        .collect()
}

pub fn borough_codes() -> HashMap<String, String> {
    create_dict(&BOROUGHS, |n| format!("B{n}"))
}

pub fn cuisine_codes() -> HashMap<String, String> {
    create_dict(&CUISINES, |n| format!("C{n}"))
}

/// Dimension rows for the boroughs table, in reference order, with
/// population merged in by name. Boroughs missing from the population
/// map get none, not an error.
pub fn borough_rows(
    codes: &HashMap<String, String>,
    populations: &HashMap<String, i64>,
) -> Vec<BoroughRow> {
    BOROUGHS
        .iter()
        .filter_map(|name| {
            codes.get(*name).map(|code| BoroughRow {
                borough_id: code.clone(),
                borough: (*name).to_owned(),
                population: populations.get(*name).copied(),
            })
        })
        .collect()
}

/// Dimension rows for the cuisines table, in reference order.
pub fn cuisine_rows(codes: &HashMap<String, String>) -> Vec<CuisineRow> {
    CUISINES
        .iter()
        .filter_map(|name| {
            codes.get(*name).map(|code| CuisineRow {
                cuisine_id: code.clone(),
                cuisine: (*name).to_owned(),
            })
        })
        .collect()
}

/// Parse an upstream inspection date. The row service emits floating
/// timestamps (`2024-05-17T00:00:00.000`); cached fixtures may carry bare
/// dates. Only the date part is meaningful.
pub fn parse_inspection_date(value: &str) -> Option<NaiveDate> {
    let date_part = value.split('T').next().unwrap_or(value);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

/// Deduplicate and filter raw inspection rows.
///
/// Rows are sorted newest-first and deduplicated on `id`, so each location
/// keeps exactly its most recent inspection. The surviving rows then pass
/// through [`retain`], which drops fast-food names and anything outside the
/// cuisine and borough reference sets — after this no row can produce a
/// dangling foreign key downstream.
pub fn clean(
    raw: Vec<RawInspection>,
    fastfood_names: &HashSet<String>,
    cuisines: &[&str],
    boroughs: &[&str],
) -> Result<Vec<Restaurant>, TransformError> {
    let mut parsed = Vec::with_capacity(raw.len());
    for row in raw {
        let inspection_date = parse_inspection_date(&row.inspection_date).ok_or_else(|| {
            TransformError::BadDate {
                id: row.id,
                value: row.inspection_date.clone(),
            }
        })?;
        parsed.push(Restaurant {
            id: row.id,
            name: row.name,
            borough: row.borough,
            cuisine: row.cuisine,
            inspection_date,
            lat: row.lat,
            lng: row.lng,
        });
    }

    // Newest first; the first occurrence of an id wins below.
    parsed.sort_by(|a, b| b.inspection_date.cmp(&a.inspection_date));

    let mut seen = HashSet::new();
    parsed.retain(|row| seen.insert(row.id));

    Ok(retain(parsed, fastfood_names, cuisines, boroughs))
}

/// The retain/exclude filter applied by [`clean`], split out because it is
/// idempotent and tested as such: drop fast-food names, keep only allowed
/// cuisines and known boroughs.
pub fn retain(
    rows: Vec<Restaurant>,
    fastfood_names: &HashSet<String>,
    cuisines: &[&str],
    boroughs: &[&str],
) -> Vec<Restaurant> {
    rows.into_iter()
        .filter(|row| {
            !fastfood_names.contains(&row.name)
                && cuisines.contains(&row.cuisine.as_str())
                && boroughs.contains(&row.borough.as_str())
        })
        .collect()
}

/// Re-key cleaned rows against both dimension maps. [`clean`] guarantees
/// every surviving row has entries in both maps, so this neither adds nor
/// removes rows.
pub fn normalize(
    cleaned: Vec<Restaurant>,
    borough_codes: &HashMap<String, String>,
    cuisine_codes: &HashMap<String, String>,
) -> Vec<FactRow> {
    cleaned
        .into_iter()
        .filter_map(|row| {
            let borough_id = borough_codes.get(&row.borough)?.clone();
            let cuisine_id = cuisine_codes.get(&row.cuisine)?.clone();
            Some(FactRow {
                id: row.id,
                name: row.name,
                borough_id,
                cuisine_id,
                inspection_date: row.inspection_date,
                lat: row.lat,
                lng: row.lng,
            })
        })
        .collect()
}

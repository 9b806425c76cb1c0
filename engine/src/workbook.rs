//! FILENAME: engine/src/workbook.rs
//! PURPOSE: The workbook orchestrator: public API and recompute pipeline.
//! CONTEXT: A workbook is an ordered collection of named sheets plus the
//! dependency graph spanning all of them. Every mutating operation funnels
//! into one batch recompute: update the mutated cells' edges, find
//! everything transitively depending on them (reverse reachability), mark
//! strongly connected components as circular-reference errors, evaluate
//! the acyclic remainder in topological order, and hand the batch of
//! changed cells to the registered observers.
//!
//! Observer callbacks run synchronously inside the mutating call, after
//! values have been stored. They receive the workbook and the changed
//! (sheet name, location) pairs, sorted by (sheet order, row, col) so
//! notification order is deterministic. A panicking observer is isolated
//! from the computation and from other observers.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};

use parser::ast::ErrorKind;

use crate::cell::{Cell, CellValue};
use crate::coord::{self, loc_from_coords, CellCoord, MAX_COL, MAX_ROW};
use crate::dependency_extractor::extract_dependencies;
use crate::dependency_graph::{CellId, DependencyGraph, Direction};
use crate::error::{Result, WorkbookError};
use crate::evaluator::{Evaluator, SheetContext};
use crate::reference_rewriter;
use crate::sheet::Sheet;

/// Observer signature: the workbook plus the changed (sheet, location)
/// pairs for one mutation.
pub type CellChangeObserver = Box<dyn Fn(&Workbook, &[(String, String)])>;

/// A workbook containing zero or more named spreadsheets.
///
/// Sheet names preserve the user's capitalization but match
/// case-insensitively. The order of `sheet_names` is the user-visible tab
/// order; new and copied sheets append, move_sheet reorders.
pub struct Workbook {
    /// Display names in tab order.
    sheet_names: Vec<String>,
    /// Sheets keyed by casefolded name.
    sheets: HashMap<String, Sheet>,
    /// Cross-sheet reference graph over every formula cell.
    graph: DependencyGraph,
    /// Observers in registration order.
    observers: Vec<CellChangeObserver>,
}

impl Workbook {
    /// Creates a new empty workbook.
    pub fn new() -> Self {
        Workbook {
            sheet_names: Vec::new(),
            sheets: HashMap::new(),
            graph: DependencyGraph::new(),
            observers: Vec::new(),
        }
    }

    // ========================================================================
    // Sheet operations
    // ========================================================================

    /// Number of sheets in the workbook.
    pub fn num_sheets(&self) -> usize {
        self.sheet_names.len()
    }

    /// Sheet display names in tab order. The returned list is the caller's
    /// to mutate.
    pub fn list_sheets(&self) -> Vec<String> {
        self.sheet_names.clone()
    }

    /// Adds a sheet. With no name given, the lowest unused "Sheet{N}" is
    /// generated. Returns the new sheet's index and name.
    pub fn new_sheet(&mut self, sheet_name: Option<&str>) -> Result<(usize, String)> {
        let name = match sheet_name {
            Some(name) => {
                validate_sheet_name(name)?;
                if self.sheets.contains_key(&name.to_lowercase()) {
                    return Err(WorkbookError::DuplicateSheetName(name.to_string()));
                }
                name.to_string()
            }
            None => {
                let mut n = 1;
                loop {
                    let candidate = format!("Sheet{}", n);
                    if !self.sheets.contains_key(&candidate.to_lowercase()) {
                        break candidate;
                    }
                    n += 1;
                }
            }
        };

        let key = name.to_lowercase();
        self.sheet_names.push(name.clone());
        self.sheets.insert(key.clone(), Sheet::new(name.clone()));

        // Formulas that already referenced this name stop being #REF!
        let seeds: HashSet<CellId> = self
            .graph
            .referenced_nodes_on_sheet(&key)
            .into_iter()
            .collect();
        self.recompute(seeds, HashMap::new());

        Ok((self.num_sheets() - 1, name))
    }

    /// Deletes a sheet. Every formula referencing it re-evaluates to a
    /// reference error.
    pub fn del_sheet(&mut self, sheet_name: &str) -> Result<()> {
        let key = self.existing_key(sheet_name)?;

        let sheet = self.sheets.remove(&key).expect("sheet looked up above");
        self.sheet_names.retain(|name| name.to_lowercase() != key);

        // Dying cells leave no residue in the graph
        for coord in sheet.coords_row_major() {
            let id = (key.clone(), loc_from_coords(coord));
            self.graph.clear_out_edges(&id);
        }

        let seeds: HashSet<CellId> = self
            .graph
            .referenced_nodes_on_sheet(&key)
            .into_iter()
            .collect();
        self.recompute(seeds, HashMap::new());
        Ok(())
    }

    /// Renames a sheet and rewrites every formula that referenced it,
    /// re-quoting the qualifier as the new name requires.
    pub fn rename_sheet(&mut self, sheet_name: &str, new_sheet_name: &str) -> Result<()> {
        let old_key = self.existing_key(sheet_name)?;
        validate_sheet_name(new_sheet_name)?;
        if self.sheets.contains_key(&new_sheet_name.to_lowercase()) {
            return Err(WorkbookError::DuplicateSheetName(new_sheet_name.to_string()));
        }
        let new_key = new_sheet_name.to_lowercase();

        // Cells whose formulas name the old sheet, found before any edges move
        let mut referrers: HashSet<CellId> = HashSet::new();
        for node in self.graph.referenced_nodes_on_sheet(&old_key) {
            if let Some(parents) = self.graph.in_edges_of(&node) {
                referrers.extend(parents.iter().cloned());
            }
        }

        // Re-key the sheet in the name list and the map
        let mut sheet = self.sheets.remove(&old_key).expect("sheet looked up above");
        let old_display = sheet.name().to_string();
        sheet.set_name(new_sheet_name);
        let index = self
            .sheet_names
            .iter()
            .position(|name| name == &old_display)
            .expect("display name tracked");
        self.sheet_names[index] = new_sheet_name.to_string();
        self.sheets.insert(new_key.clone(), sheet);

        // The renamed sheet's own cells migrate to new graph ids
        let coords = self.sheets[&new_key].coords_row_major();
        for &coord in &coords {
            let old_id = (old_key.clone(), loc_from_coords(coord));
            self.graph.clear_out_edges(&old_id);
        }

        // Referrer ids on the renamed sheet migrate too
        let referrers: Vec<CellId> = referrers
            .into_iter()
            .map(|(sheet_key, loc)| {
                if sheet_key == old_key {
                    (new_key.clone(), loc)
                } else {
                    (sheet_key, loc)
                }
            })
            .collect();

        // Rewrite the referrers' formulas and re-ingest them
        let mut baseline: HashMap<CellId, CellValue> = HashMap::new();
        let mut seeds: HashSet<CellId> = HashSet::new();
        for id in &referrers {
            let coord = match coord::parse_loc(&id.1) {
                Some(parsed) => parsed.coords(),
                None => continue,
            };
            let Some(old_cell) = self.sheets.get(&id.0).and_then(|s| s.cell(coord)) else {
                continue;
            };
            baseline.insert(id.clone(), old_cell.value.clone());
            let rewritten = reference_rewriter::rename_sheet_in_contents(
                &old_cell.contents,
                &old_display,
                new_sheet_name,
            );
            let cell = Cell::new(rewritten, &id.0);
            self.graph.set_out_edges(id, cell.out_refs.clone());
            self.sheets
                .get_mut(&id.0)
                .expect("sheet exists")
                .set_cell(coord, cell);
            seeds.insert(id.clone());
        }

        // Remaining formulas on the renamed sheet keep their contents, but
        // their unqualified references now resolve under the new key
        for &coord in &coords {
            let id = (new_key.clone(), loc_from_coords(coord));
            let sheet = self.sheets.get_mut(&new_key).expect("sheet exists");
            if let Some(cell) = sheet.cell_mut(coord) {
                if let Some(ast) = &cell.ast {
                    let refs = extract_dependencies(ast, &new_key);
                    cell.out_refs = refs.clone();
                    self.graph.set_out_edges(&id, refs);
                }
            }
        }

        // Formulas that referenced the new name before it existed revive
        seeds.extend(self.graph.referenced_nodes_on_sheet(&new_key));
        self.recompute(seeds, baseline);
        Ok(())
    }

    /// Moves a sheet to the given position in the tab order. Nothing
    /// recomputes, but future notification order follows the new order.
    pub fn move_sheet(&mut self, sheet_name: &str, index: usize) -> Result<()> {
        let key = self.existing_key(sheet_name)?;
        if index >= self.num_sheets() {
            return Err(WorkbookError::IndexOutOfRange(index as i64));
        }

        let position = self
            .sheet_names
            .iter()
            .position(|name| name.to_lowercase() == key)
            .expect("display name tracked");
        let name = self.sheet_names.remove(position);
        self.sheet_names.insert(index, name);
        Ok(())
    }

    /// Copies a sheet, appending the copy as "{orig}_{k}" with the
    /// smallest unused k. Only contents are copied; values recompute from
    /// scratch.
    pub fn copy_sheet(&mut self, sheet_name: &str) -> Result<(usize, String)> {
        let src_key = self.existing_key(sheet_name)?;
        let src_display = self.sheets[&src_key].name().to_string();

        let mut k = 1;
        let copy_name = loop {
            let candidate = format!("{}_{}", src_display, k);
            if !self.sheets.contains_key(&candidate.to_lowercase()) {
                break candidate;
            }
            k += 1;
        };
        let copy_key = copy_name.to_lowercase();

        let snapshot: Vec<(CellCoord, String)> = self.sheets[&src_key]
            .coords_row_major()
            .into_iter()
            .map(|coord| {
                let contents = self.sheets[&src_key]
                    .cell(coord)
                    .expect("coord from key set")
                    .contents
                    .clone();
                (coord, contents)
            })
            .collect();

        self.sheet_names.push(copy_name.clone());
        self.sheets.insert(copy_key.clone(), Sheet::new(copy_name.clone()));

        let mut baseline: HashMap<CellId, CellValue> = HashMap::new();
        let mut seeds: HashSet<CellId> = HashSet::new();
        for (coord, contents) in &snapshot {
            let id = self.store_cell(&copy_key, *coord, Some(contents));
            baseline.insert(id.clone(), CellValue::Empty);
            seeds.insert(id);
        }
        seeds.extend(self.graph.referenced_nodes_on_sheet(&copy_key));

        self.recompute(seeds, baseline);
        Ok((self.num_sheets() - 1, copy_name))
    }

    /// The extent of a sheet as (cols, rows).
    pub fn get_sheet_extent(&self, sheet_name: &str) -> Result<(u32, u32)> {
        let key = self.existing_key(sheet_name)?;
        Ok(self.sheets[&key].extent())
    }

    /// Borrow a sheet by name. Used by persistence for export.
    pub fn sheet(&self, sheet_name: &str) -> Result<&Sheet> {
        let key = self.existing_key(sheet_name)?;
        Ok(&self.sheets[&key])
    }

    // ========================================================================
    // Cell operations
    // ========================================================================

    /// Sets the contents of a cell. Contents are trimmed; empty or
    /// whitespace-only contents (or None) delete the cell. Formula
    /// problems never raise; they become error values.
    pub fn set_cell_contents(
        &mut self,
        sheet_name: &str,
        location: &str,
        contents: Option<&str>,
    ) -> Result<()> {
        let key = self.existing_key(sheet_name)?;
        let coord = parse_api_loc(location)?;

        let id = (key.clone(), loc_from_coords(coord));
        let mut baseline = HashMap::new();
        baseline.insert(id.clone(), self.value_of(&id));

        self.store_cell(&key, coord, contents);

        let mut seeds = HashSet::new();
        seeds.insert(id);
        self.recompute(seeds, baseline);
        Ok(())
    }

    /// The raw contents of a cell, or None for an empty cell.
    pub fn get_cell_contents(&self, sheet_name: &str, location: &str) -> Result<Option<String>> {
        let key = self.existing_key(sheet_name)?;
        let coord = parse_api_loc(location)?;
        Ok(self.sheets[&key]
            .cell(coord)
            .map(|cell| cell.contents.clone()))
    }

    /// The computed value of a cell. Empty cells are CellValue::Empty.
    pub fn get_cell_value(&self, sheet_name: &str, location: &str) -> Result<CellValue> {
        let key = self.existing_key(sheet_name)?;
        let coord = parse_api_loc(location)?;
        Ok(self.sheets[&key]
            .cell(coord)
            .map(|cell| cell.value.clone())
            .unwrap_or(CellValue::Empty))
    }

    /// Moves a rectangular region: source cells are cleared, target cells
    /// overwritten, and relative references in moved formulas shift by the
    /// relocation delta.
    pub fn move_cells(
        &mut self,
        sheet_name: &str,
        start_location: &str,
        end_location: &str,
        to_location: &str,
        to_sheet: Option<&str>,
    ) -> Result<()> {
        self.transfer_cells(
            sheet_name,
            start_location,
            end_location,
            to_location,
            to_sheet,
            true,
        )
    }

    /// Copies a rectangular region; the source stays put.
    pub fn copy_cells(
        &mut self,
        sheet_name: &str,
        start_location: &str,
        end_location: &str,
        to_location: &str,
        to_sheet: Option<&str>,
    ) -> Result<()> {
        self.transfer_cells(
            sheet_name,
            start_location,
            end_location,
            to_location,
            to_sheet,
            false,
        )
    }

    fn transfer_cells(
        &mut self,
        sheet_name: &str,
        start_location: &str,
        end_location: &str,
        to_location: &str,
        to_sheet: Option<&str>,
        delete_source: bool,
    ) -> Result<()> {
        let src_key = self.existing_key(sheet_name)?;
        let dest_key = match to_sheet {
            Some(name) => self.existing_key(name)?,
            None => src_key.clone(),
        };

        let corner_a = parse_api_loc(start_location)?;
        let corner_b = parse_api_loc(end_location)?;
        let to = parse_api_loc(to_location)?;

        let top_left = (corner_a.0.min(corner_b.0), corner_a.1.min(corner_b.1));
        let bot_right = (corner_a.0.max(corner_b.0), corner_a.1.max(corner_b.1));
        let dcol = to.0 as i64 - top_left.0 as i64;
        let drow = to.1 as i64 - top_left.1 as i64;

        // The whole destination rectangle must stay on the grid
        if bot_right.0 as i64 + dcol > MAX_COL as i64
            || bot_right.1 as i64 + drow > MAX_ROW as i64
        {
            return Err(WorkbookError::InvalidLocation(to_location.to_string()));
        }

        // Snapshot before mutating anything: regions may overlap
        let mut snapshot: Vec<(CellCoord, Option<String>)> = Vec::new();
        for col in top_left.0..=bot_right.0 {
            for row in top_left.1..=bot_right.1 {
                let contents = self.sheets[&src_key]
                    .cell((col, row))
                    .map(|cell| cell.contents.clone());
                snapshot.push(((col, row), contents));
            }
        }

        let mut baseline: HashMap<CellId, CellValue> = HashMap::new();
        let mut seeds: HashSet<CellId> = HashSet::new();
        for (coord, _) in &snapshot {
            if delete_source {
                let id = (src_key.clone(), loc_from_coords(*coord));
                baseline.insert(id.clone(), self.value_of(&id));
                seeds.insert(id);
            }
            let dest_coord = (
                (coord.0 as i64 + dcol) as u32,
                (coord.1 as i64 + drow) as u32,
            );
            let id = (dest_key.clone(), loc_from_coords(dest_coord));
            baseline
                .entry(id.clone())
                .or_insert_with(|| self.value_of(&id));
            seeds.insert(id);
        }

        if delete_source {
            for (coord, _) in &snapshot {
                self.store_cell(&src_key, *coord, None);
            }
        }

        for (coord, contents) in &snapshot {
            let dest_coord = (
                (coord.0 as i64 + dcol) as u32,
                (coord.1 as i64 + drow) as u32,
            );
            match contents {
                Some(text) => {
                    let shifted = reference_rewriter::shift_contents(text, dcol, drow);
                    self.store_cell(&dest_key, dest_coord, Some(&shifted));
                }
                // Empty source cells clear the corresponding target cells
                None => {
                    self.store_cell(&dest_key, dest_coord, None);
                }
            }
        }

        self.recompute(seeds, baseline);
        Ok(())
    }

    /// Sorts the rows of a region by the given 1-based column indices
    /// (negative for descending), stably. Formulas in rows that move are
    /// shifted by the row delta, exactly as move_cells shifts them.
    pub fn sort_region(
        &mut self,
        sheet_name: &str,
        start_location: &str,
        end_location: &str,
        sort_cols: &[i32],
    ) -> Result<()> {
        let key = self.existing_key(sheet_name)?;
        let corner_a = parse_api_loc(start_location)?;
        let corner_b = parse_api_loc(end_location)?;
        let top_left = (corner_a.0.min(corner_b.0), corner_a.1.min(corner_b.1));
        let bot_right = (corner_a.0.max(corner_b.0), corner_a.1.max(corner_b.1));
        let width = bot_right.0 - top_left.0 + 1;

        if sort_cols.is_empty() {
            return Err(WorkbookError::IndexOutOfRange(0));
        }
        let mut seen = HashSet::new();
        for &col in sort_cols {
            let magnitude = col.unsigned_abs();
            if col == 0 || magnitude > width || !seen.insert(magnitude) {
                return Err(WorkbookError::IndexOutOfRange(col as i64));
            }
        }

        struct RowSnapshot {
            original_row: u32,
            cells: HashMap<u32, (String, CellValue)>,
        }

        let mut rows: Vec<RowSnapshot> = Vec::new();
        for row in top_left.1..=bot_right.1 {
            let mut cells = HashMap::new();
            for offset in 0..width {
                if let Some(cell) = self.sheets[&key].cell((top_left.0 + offset, row)) {
                    cells.insert(offset, (cell.contents.clone(), cell.value.clone()));
                }
            }
            rows.push(RowSnapshot {
                original_row: row,
                cells,
            });
        }

        // Stable sort keeps the original order of equal-key rows
        let empty = CellValue::Empty;
        rows.sort_by(|a, b| {
            for &col in sort_cols {
                let offset = col.unsigned_abs() - 1;
                let left = a.cells.get(&offset).map(|c| &c.1).unwrap_or(&empty);
                let right = b.cells.get(&offset).map(|c| &c.1).unwrap_or(&empty);
                let mut ordering = left.total_order(right);
                if col < 0 {
                    ordering = ordering.reverse();
                }
                if ordering != std::cmp::Ordering::Equal {
                    return ordering;
                }
            }
            std::cmp::Ordering::Equal
        });

        let mut baseline: HashMap<CellId, CellValue> = HashMap::new();
        let mut seeds: HashSet<CellId> = HashSet::new();
        for col in top_left.0..=bot_right.0 {
            for row in top_left.1..=bot_right.1 {
                let id = (key.clone(), loc_from_coords((col, row)));
                baseline.insert(id.clone(), self.value_of(&id));
                seeds.insert(id);
            }
        }

        for col in top_left.0..=bot_right.0 {
            for row in top_left.1..=bot_right.1 {
                self.store_cell(&key, (col, row), None);
            }
        }

        for (index, row_snapshot) in rows.iter().enumerate() {
            let new_row = top_left.1 + index as u32;
            let drow = new_row as i64 - row_snapshot.original_row as i64;
            for (offset, (contents, _)) in &row_snapshot.cells {
                let shifted = reference_rewriter::shift_contents(contents, 0, drow);
                self.store_cell(&key, (top_left.0 + offset, new_row), Some(&shifted));
            }
        }

        self.recompute(seeds, baseline);
        Ok(())
    }

    /// Registers an observer called after each mutation that changed cell
    /// values. Observers are called in registration order; a panicking
    /// observer does not disturb the others or the computation.
    pub fn notify_cells_changed<F>(&mut self, observer: F)
    where
        F: Fn(&Workbook, &[(String, String)]) + 'static,
    {
        self.observers.push(Box::new(observer));
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn existing_key(&self, sheet_name: &str) -> Result<String> {
        let key = sheet_name.to_lowercase();
        if self.sheets.contains_key(&key) {
            Ok(key)
        } else {
            Err(WorkbookError::SheetNotFound(sheet_name.to_string()))
        }
    }

    /// Writes (or clears) one cell and keeps the graph in sync. Trimming
    /// happens here: whitespace-only contents delete the cell.
    fn store_cell(&mut self, sheet_key: &str, coord: CellCoord, contents: Option<&str>) -> CellId {
        let id = (sheet_key.to_string(), loc_from_coords(coord));
        let trimmed = contents.map(str::trim).filter(|text| !text.is_empty());

        match trimmed {
            None => {
                self.sheets
                    .get_mut(sheet_key)
                    .expect("sheet exists")
                    .remove_cell(coord);
                self.graph.clear_out_edges(&id);
            }
            Some(text) => {
                let cell = Cell::new(text.to_string(), sheet_key);
                self.graph.set_out_edges(&id, cell.out_refs.clone());
                self.sheets
                    .get_mut(sheet_key)
                    .expect("sheet exists")
                    .set_cell(coord, cell);
            }
        }

        id
    }

    /// The current stored value of a node, Empty when no cell is there.
    fn value_of(&self, id: &CellId) -> CellValue {
        let Some(sheet) = self.sheets.get(&id.0) else {
            return CellValue::Empty;
        };
        let Some(parsed) = coord::parse_loc(&id.1) else {
            return CellValue::Empty;
        };
        sheet
            .cell(parsed.coords())
            .map(|cell| cell.value.clone())
            .unwrap_or(CellValue::Empty)
    }

    /// Deterministic node order: (sheet tab order, row, col). Nodes on
    /// unknown sheets order after all real sheets, by key.
    fn node_order_key(&self, id: &CellId) -> (usize, String, u32, u32) {
        let sheet_index = self
            .sheet_names
            .iter()
            .position(|name| name.to_lowercase() == id.0)
            .unwrap_or(usize::MAX);
        let (col, row) = coord::split_loc_unchecked(&id.1);
        (sheet_index, id.0.clone(), row, col)
    }

    /// Re-evaluates one node and stores its value, returning it. Nodes
    /// without a live cell evaluate as Empty; literal cells keep their
    /// ingested value.
    fn evaluate_node(&mut self, id: &CellId) -> CellValue {
        let Some(parsed) = coord::parse_loc(&id.1) else {
            return CellValue::Empty;
        };
        let coord = parsed.coords();

        let (ast, stored) = {
            let Some(cell) = self.sheets.get(&id.0).and_then(|s| s.cell(coord)) else {
                return CellValue::Empty;
            };
            (cell.ast.clone(), cell.value.clone())
        };

        match ast {
            Some(ast) => {
                let value = {
                    let evaluator = Evaluator::new(SheetContext {
                        sheets: &self.sheets,
                        current_sheet: &id.0,
                    });
                    evaluator.evaluate_cell(&ast)
                };
                let cell = self
                    .sheets
                    .get_mut(&id.0)
                    .and_then(|s| s.cell_mut(coord))
                    .expect("cell present above");
                cell.value = value.clone();
                value
            }
            None => stored,
        }
    }

    /// The recompute pipeline. `seeds` are the just-mutated nodes (their
    /// edges already updated); `baseline` carries pre-mutation values for
    /// change detection where the store no longer has them.
    fn recompute(&mut self, seeds: HashSet<CellId>, baseline: HashMap<CellId, CellValue>) {
        if seeds.is_empty() {
            return;
        }

        let affected = self.graph.reachable_from(seeds.iter(), Direction::Reverse);
        let mut nodes: Vec<CellId> = affected.into_iter().collect();
        nodes.sort_by_key(|id| self.node_order_key(id));

        log::debug!(
            "recompute: {} seed(s), {} affected cell(s)",
            seeds.len(),
            nodes.len()
        );

        // Cycles become circular-reference errors and skip evaluation
        let mut cycle_members: HashSet<CellId> = HashSet::new();
        for component in self.graph.scc(&nodes) {
            let is_cycle =
                component.len() > 1 || self.graph.has_edge(&component[0], &component[0]);
            if is_cycle {
                cycle_members.extend(component);
            }
        }

        let mut changed: Vec<CellId> = Vec::new();

        for id in nodes.iter().filter(|id| cycle_members.contains(*id)) {
            let old = baseline
                .get(id)
                .cloned()
                .unwrap_or_else(|| self.value_of(id));
            let Some(parsed) = coord::parse_loc(&id.1) else {
                continue;
            };
            let Some(cell) = self
                .sheets
                .get_mut(&id.0)
                .and_then(|s| s.cell_mut(parsed.coords()))
            else {
                continue;
            };
            let new_value =
                CellValue::error(ErrorKind::CircRef, "cell is part of a circular reference");
            cell.value = new_value.clone();
            if new_value != old {
                changed.push(id.clone());
            }
        }

        let acyclic: Vec<CellId> = nodes
            .iter()
            .filter(|id| !cycle_members.contains(*id))
            .cloned()
            .collect();

        for id in self.graph.toposort(&acyclic) {
            let old = baseline
                .get(&id)
                .cloned()
                .unwrap_or_else(|| self.value_of(&id));
            let new_value = self.evaluate_node(&id);
            if new_value != old {
                changed.push(id);
            }
        }

        if changed.is_empty() {
            return;
        }
        changed.sort_by_key(|id| self.node_order_key(id));

        // Cells on sheets that no longer exist cannot be reported
        let notification: Vec<(String, String)> = changed
            .iter()
            .filter_map(|id| {
                self.sheets
                    .get(&id.0)
                    .map(|sheet| (sheet.name().to_string(), id.1.clone()))
            })
            .collect();
        if notification.is_empty() {
            return;
        }

        log::debug!("notifying observers of {} change(s)", notification.len());
        for observer in &self.observers {
            let _ = catch_unwind(AssertUnwindSafe(|| observer(self, &notification)));
        }
    }
}

impl Default for Workbook {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Workbook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workbook")
            .field("sheet_names", &self.sheet_names)
            .field("cells", &self.sheets.values().map(Sheet::cell_count).sum::<usize>())
            .finish()
    }
}

/// A location given through the public API: plain A1 style, no absolute
/// markers.
fn parse_api_loc(location: &str) -> Result<CellCoord> {
    match coord::parse_loc(location) {
        Some(parsed) if !parsed.abs_col && !parsed.abs_row => Ok(parsed.coords()),
        _ => Err(WorkbookError::InvalidLocation(location.to_string())),
    }
}

/// Sheet names: non-empty, no surrounding whitespace, and only letters,
/// digits, spaces, and the punctuation set .?!,:;@#$%^&*()-_
fn validate_sheet_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name == name.trim()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || " .?!,:;@#$%^&*()-_".contains(c));
    if valid {
        Ok(())
    } else {
        Err(WorkbookError::InvalidSheetName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::str::FromStr;

    use rust_decimal::Decimal;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn num(s: &str) -> CellValue {
        CellValue::Number(dec(s))
    }

    fn text(s: &str) -> CellValue {
        CellValue::Text(s.to_string())
    }

    fn value(wb: &Workbook, sheet: &str, loc: &str) -> CellValue {
        wb.get_cell_value(sheet, loc).unwrap()
    }

    fn kind(wb: &Workbook, sheet: &str, loc: &str) -> Option<ErrorKind> {
        value(wb, sheet, loc).error_kind()
    }

    /// Records every notification batch for later inspection.
    fn track_notifications(wb: &mut Workbook) -> Rc<RefCell<Vec<Vec<(String, String)>>>> {
        let log: Rc<RefCell<Vec<Vec<(String, String)>>>> = Rc::new(RefCell::new(Vec::new()));
        let handle = Rc::clone(&log);
        wb.notify_cells_changed(move |_, changed| {
            handle.borrow_mut().push(changed.to_vec());
        });
        log
    }

    // ========================================================================
    // Sheet management
    // ========================================================================

    #[test]
    fn test_empty_workbook() {
        let wb = Workbook::new();
        assert_eq!(wb.num_sheets(), 0);
        assert!(wb.list_sheets().is_empty());
        assert_eq!(
            wb.get_cell_value("Sheet1", "A1"),
            Err(WorkbookError::SheetNotFound("Sheet1".to_string()))
        );
    }

    #[test]
    fn test_auto_sheet_names_use_lowest_unused() {
        let mut wb = Workbook::new();
        assert_eq!(wb.new_sheet(None).unwrap(), (0, "Sheet1".to_string()));
        assert_eq!(wb.new_sheet(None).unwrap(), (1, "Sheet2".to_string()));
        wb.del_sheet("Sheet1").unwrap();
        assert_eq!(wb.new_sheet(None).unwrap(), (1, "Sheet1".to_string()));
        assert_eq!(wb.list_sheets(), vec!["Sheet2", "Sheet1"]);
    }

    #[test]
    fn test_sheet_name_validation() {
        let mut wb = Workbook::new();
        assert!(matches!(
            wb.new_sheet(Some("")),
            Err(WorkbookError::InvalidSheetName(_))
        ));
        assert!(matches!(
            wb.new_sheet(Some(" padded ")),
            Err(WorkbookError::InvalidSheetName(_))
        ));
        assert!(matches!(
            wb.new_sheet(Some("bad~name")),
            Err(WorkbookError::InvalidSheetName(_))
        ));
        assert!(matches!(
            wb.new_sheet(Some("no'quotes")),
            Err(WorkbookError::InvalidSheetName(_))
        ));

        wb.new_sheet(Some("Report (Q1) - #2!")).unwrap();
        assert!(matches!(
            wb.new_sheet(Some("report (q1) - #2!")),
            Err(WorkbookError::DuplicateSheetName(_))
        ));
    }

    #[test]
    fn test_list_sheets_is_independent() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("Only")).unwrap();
        let mut listed = wb.list_sheets();
        listed.push("Imposter".to_string());
        assert_eq!(wb.list_sheets(), vec!["Only"]);
    }

    #[test]
    fn test_sheet_lookup_is_case_insensitive() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("MySheet")).unwrap();
        wb.set_cell_contents("MYSHEET", "A1", Some("1")).unwrap();
        assert_eq!(value(&wb, "mysheet", "a1"), num("1"));
        assert_eq!(wb.list_sheets(), vec!["MySheet"]);
    }

    #[test]
    fn test_move_sheet() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("A")).unwrap();
        wb.new_sheet(Some("B")).unwrap();
        wb.new_sheet(Some("C")).unwrap();

        wb.move_sheet("c", 0).unwrap();
        assert_eq!(wb.list_sheets(), vec!["C", "A", "B"]);

        assert_eq!(
            wb.move_sheet("A", 3),
            Err(WorkbookError::IndexOutOfRange(3))
        );
        assert_eq!(
            wb.move_sheet("Missing", 0),
            Err(WorkbookError::SheetNotFound("Missing".to_string()))
        );
    }

    #[test]
    fn test_get_sheet_extent() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();
        assert_eq!(wb.get_sheet_extent(&sheet).unwrap(), (0, 0));

        wb.set_cell_contents(&sheet, "D5", Some("x")).unwrap();
        wb.set_cell_contents(&sheet, "B9", Some("y")).unwrap();
        assert_eq!(wb.get_sheet_extent(&sheet).unwrap(), (4, 9));

        wb.set_cell_contents(&sheet, "B9", None).unwrap();
        assert_eq!(wb.get_sheet_extent(&sheet).unwrap(), (4, 5));
    }

    // ========================================================================
    // Cell contents and values
    // ========================================================================

    #[test]
    fn test_contents_are_trimmed_and_preserved() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();

        wb.set_cell_contents(&sheet, "A1", Some("  =1+1  ")).unwrap();
        assert_eq!(
            wb.get_cell_contents(&sheet, "A1").unwrap(),
            Some("=1+1".to_string())
        );
        assert_eq!(value(&wb, &sheet, "A1"), num("2"));
    }

    #[test]
    fn test_whitespace_contents_clear_the_cell() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();

        wb.set_cell_contents(&sheet, "A1", Some("5")).unwrap();
        wb.set_cell_contents(&sheet, "A1", Some("   ")).unwrap();
        assert_eq!(wb.get_cell_contents(&sheet, "A1").unwrap(), None);
        assert_eq!(value(&wb, &sheet, "A1"), CellValue::Empty);
        assert_eq!(wb.get_sheet_extent(&sheet).unwrap(), (0, 0));

        wb.set_cell_contents(&sheet, "A1", Some("5")).unwrap();
        wb.set_cell_contents(&sheet, "A1", None).unwrap();
        assert_eq!(wb.get_cell_contents(&sheet, "A1").unwrap(), None);
    }

    #[test]
    fn test_literal_value_types() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();

        wb.set_cell_contents(&sheet, "A1", Some("3.1")).unwrap();
        wb.set_cell_contents(&sheet, "A2", Some("True")).unwrap();
        wb.set_cell_contents(&sheet, "A3", Some("some words")).unwrap();
        wb.set_cell_contents(&sheet, "A4", Some("'3.1")).unwrap();
        wb.set_cell_contents(&sheet, "A5", Some("#REF!")).unwrap();
        wb.set_cell_contents(&sheet, "A6", Some("12string")).unwrap();

        assert_eq!(value(&wb, &sheet, "A1"), num("3.1"));
        assert_eq!(value(&wb, &sheet, "A2"), CellValue::Bool(true));
        assert_eq!(value(&wb, &sheet, "A3"), text("some words"));
        assert_eq!(value(&wb, &sheet, "A4"), text("3.1"));
        assert_eq!(kind(&wb, &sheet, "A5"), Some(ErrorKind::BadRef));
        assert_eq!(value(&wb, &sheet, "A6"), text("12string"));
    }

    #[test]
    fn test_invalid_locations_rejected() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();

        for loc in ["A0", "A01", "ZZZZ9999", "$A$1", "1A", "A", "A1B2"] {
            assert_eq!(
                wb.set_cell_contents(&sheet, loc, Some("1")),
                Err(WorkbookError::InvalidLocation(loc.to_string())),
                "location {:?} should be invalid",
                loc
            );
        }

        // The extreme corner is fine
        wb.set_cell_contents(&sheet, "NTO9999", Some("1")).unwrap();
        assert_eq!(wb.get_sheet_extent(&sheet).unwrap(), (9999, 9999));
    }

    #[test]
    fn test_scenario_arithmetic_and_coercion() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();

        wb.set_cell_contents(&sheet, "A1", Some("'5")).unwrap();
        wb.set_cell_contents(&sheet, "A2", Some("3")).unwrap();
        wb.set_cell_contents(&sheet, "A3", Some("=A1+A2")).unwrap();
        assert_eq!(value(&wb, &sheet, "A3"), num("8"));

        wb.set_cell_contents(&sheet, "A1", Some("hello")).unwrap();
        assert_eq!(kind(&wb, &sheet, "A3"), Some(ErrorKind::Type));
    }

    #[test]
    fn test_empty_operand_counts_as_zero() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();
        wb.set_cell_contents(&sheet, "B1", Some("=A1+1")).unwrap();
        assert_eq!(value(&wb, &sheet, "B1"), num("1"));
    }

    #[test]
    fn test_nonempty_contents_never_yield_empty_value() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();
        // A bare reference to an empty cell stores zero
        wb.set_cell_contents(&sheet, "B1", Some("=A1")).unwrap();
        assert_eq!(value(&wb, &sheet, "B1"), num("0"));
        // Literal text, even empty-looking, stores text
        wb.set_cell_contents(&sheet, "B2", Some("'")).unwrap();
        assert_eq!(value(&wb, &sheet, "B2"), text(""));
    }

    #[test]
    fn test_parse_errors_become_error_values() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();

        wb.set_cell_contents(&sheet, "A1", Some("=\"no closing quote"))
            .unwrap();
        assert_eq!(kind(&wb, &sheet, "A1"), Some(ErrorKind::Parse));
        assert_eq!(
            wb.get_cell_contents(&sheet, "A1").unwrap(),
            Some("=\"no closing quote".to_string())
        );

        wb.set_cell_contents(&sheet, "A2", Some("=AA99 +&* A2")).unwrap();
        assert_eq!(kind(&wb, &sheet, "A2"), Some(ErrorKind::Parse));
    }

    // ========================================================================
    // Cycles
    // ========================================================================

    #[test]
    fn test_simple_cycle_and_recovery() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();

        wb.set_cell_contents(&sheet, "A1", Some("=B1")).unwrap();
        wb.set_cell_contents(&sheet, "B1", Some("=A1")).unwrap();
        assert_eq!(kind(&wb, &sheet, "A1"), Some(ErrorKind::CircRef));
        assert_eq!(kind(&wb, &sheet, "B1"), Some(ErrorKind::CircRef));

        wb.set_cell_contents(&sheet, "A1", Some("1")).unwrap();
        assert_eq!(value(&wb, &sheet, "A1"), num("1"));
        assert_eq!(value(&wb, &sheet, "B1"), num("1"));
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();
        wb.set_cell_contents(&sheet, "A1", Some("=A1")).unwrap();
        assert_eq!(kind(&wb, &sheet, "A1"), Some(ErrorKind::CircRef));
    }

    #[test]
    fn test_scenario_cross_sheet_cycle() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("S1")).unwrap();
        wb.new_sheet(Some("S2")).unwrap();

        wb.set_cell_contents("S1", "A1", Some("=S2!A1")).unwrap();
        wb.set_cell_contents("S2", "A1", Some("=S1!A1")).unwrap();
        assert_eq!(kind(&wb, "S1", "A1"), Some(ErrorKind::CircRef));
        assert_eq!(kind(&wb, "S2", "A1"), Some(ErrorKind::CircRef));

        wb.set_cell_contents("S1", "A1", Some("1")).unwrap();
        assert_eq!(value(&wb, "S1", "A1"), num("1"));
        assert_eq!(value(&wb, "S2", "A1"), num("1"));
    }

    #[test]
    fn test_cells_outside_cycle_see_circref() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();

        wb.set_cell_contents(&sheet, "A1", Some("=B1")).unwrap();
        wb.set_cell_contents(&sheet, "B1", Some("=C1")).unwrap();
        wb.set_cell_contents(&sheet, "C1", Some("=B1/0")).unwrap();

        // B1 and C1 form the cycle; A1 merely references it
        assert_eq!(kind(&wb, &sheet, "B1"), Some(ErrorKind::CircRef));
        assert_eq!(kind(&wb, &sheet, "C1"), Some(ErrorKind::CircRef));
        assert_eq!(kind(&wb, &sheet, "A1"), Some(ErrorKind::CircRef));
    }

    #[test]
    fn test_conditional_references_are_conservative() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();

        // The branch is never taken, but the edge still closes a cycle
        wb.set_cell_contents(&sheet, "A1", Some("=IF(FALSE, B1, 7)"))
            .unwrap();
        assert_eq!(value(&wb, &sheet, "A1"), num("7"));
        wb.set_cell_contents(&sheet, "B1", Some("=A1")).unwrap();
        assert_eq!(kind(&wb, &sheet, "A1"), Some(ErrorKind::CircRef));
        assert_eq!(kind(&wb, &sheet, "B1"), Some(ErrorKind::CircRef));
    }

    #[test]
    fn test_indirect_argument_references_join_cycles() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();

        wb.set_cell_contents(&sheet, "E1", Some("=E2")).unwrap();
        wb.set_cell_contents(&sheet, "E2", Some("=INDIRECT(E1)")).unwrap();
        assert_eq!(kind(&wb, &sheet, "E1"), Some(ErrorKind::CircRef));
        assert_eq!(kind(&wb, &sheet, "E2"), Some(ErrorKind::CircRef));
    }

    // ========================================================================
    // Observers
    // ========================================================================

    #[test]
    fn test_scenario_observer_batching() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();
        let log = track_notifications(&mut wb);

        wb.set_cell_contents(&sheet, "A1", Some("1")).unwrap();
        assert_eq!(
            log.borrow().last().unwrap(),
            &vec![(sheet.clone(), "A1".to_string())]
        );

        wb.set_cell_contents(&sheet, "B1", Some("=A1")).unwrap();
        assert_eq!(
            log.borrow().last().unwrap(),
            &vec![(sheet.clone(), "B1".to_string())]
        );

        let batches_before = log.borrow().len();
        wb.set_cell_contents(&sheet, "A1", Some("2")).unwrap();
        // One notification for the whole mutation, A1 before B1
        assert_eq!(log.borrow().len(), batches_before + 1);
        assert_eq!(
            log.borrow().last().unwrap(),
            &vec![
                (sheet.clone(), "A1".to_string()),
                (sheet.clone(), "B1".to_string())
            ]
        );
    }

    #[test]
    fn test_no_notification_when_nothing_changes() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();
        wb.set_cell_contents(&sheet, "A1", Some("2")).unwrap();

        let log = track_notifications(&mut wb);
        wb.set_cell_contents(&sheet, "A1", Some("2")).unwrap();
        wb.set_cell_contents(&sheet, "Z9", None).unwrap();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_observer_values_are_current_when_notified() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();
        wb.set_cell_contents(&sheet, "B1", Some("=A1*2")).unwrap();

        let seen: Rc<RefCell<Vec<CellValue>>> = Rc::new(RefCell::new(Vec::new()));
        let handle = Rc::clone(&seen);
        wb.notify_cells_changed(move |wb, changed| {
            for (sheet, loc) in changed {
                handle
                    .borrow_mut()
                    .push(wb.get_cell_value(sheet, loc).unwrap());
            }
        });

        wb.set_cell_contents(&sheet, "A1", Some("4")).unwrap();
        assert_eq!(*seen.borrow(), vec![num("4"), num("8")]);
    }

    #[test]
    fn test_panicking_observer_is_isolated() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();

        wb.notify_cells_changed(|_, _| panic!("rude observer"));
        let log = track_notifications(&mut wb);

        wb.set_cell_contents(&sheet, "A1", Some("1")).unwrap();
        assert_eq!(value(&wb, &sheet, "A1"), num("1"));
        // The observer registered after the panicking one still ran
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn test_observers_called_in_registration_order() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();

        let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
        let first = Rc::clone(&order);
        let second = Rc::clone(&order);
        wb.notify_cells_changed(move |_, _| first.borrow_mut().push("first"));
        wb.notify_cells_changed(move |_, _| second.borrow_mut().push("second"));

        wb.set_cell_contents(&sheet, "A1", Some("1")).unwrap();
        assert_eq!(*order.borrow(), vec!["first", "second"]);
    }

    // ========================================================================
    // Delete / restore and cross-sheet references
    // ========================================================================

    #[test]
    fn test_scenario_delete_and_restore_sheet() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("A")).unwrap();
        wb.new_sheet(Some("B")).unwrap();

        wb.set_cell_contents("B", "X1", Some("=A!X1")).unwrap();
        wb.set_cell_contents("A", "X1", Some("7")).unwrap();
        assert_eq!(value(&wb, "B", "X1"), num("7"));

        wb.del_sheet("A").unwrap();
        assert_eq!(kind(&wb, "B", "X1"), Some(ErrorKind::BadRef));

        wb.new_sheet(Some("A")).unwrap();
        // Recreating the sheet revives the reference (target still empty)
        assert_eq!(value(&wb, "B", "X1"), num("0"));
        wb.set_cell_contents("A", "X1", Some("7")).unwrap();
        assert_eq!(value(&wb, "B", "X1"), num("7"));
    }

    #[test]
    fn test_del_sheet_notifies_dependents() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("A")).unwrap();
        wb.new_sheet(Some("B")).unwrap();
        wb.set_cell_contents("A", "X1", Some("7")).unwrap();
        wb.set_cell_contents("B", "X1", Some("=A!X1")).unwrap();

        let log = track_notifications(&mut wb);
        wb.del_sheet("A").unwrap();
        assert_eq!(
            log.borrow().last().unwrap(),
            &vec![("B".to_string(), "X1".to_string())]
        );
        assert_eq!(
            wb.del_sheet("A"),
            Err(WorkbookError::SheetNotFound("A".to_string()))
        );
    }

    #[test]
    fn test_reference_to_not_yet_created_sheet() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();
        wb.set_cell_contents(&sheet, "A1", Some("=Later!B2")).unwrap();
        assert_eq!(kind(&wb, &sheet, "A1"), Some(ErrorKind::BadRef));

        wb.new_sheet(Some("Later")).unwrap();
        assert_eq!(value(&wb, &sheet, "A1"), num("0"));
        wb.set_cell_contents("Later", "B2", Some("11")).unwrap();
        assert_eq!(value(&wb, &sheet, "A1"), num("11"));
    }

    // ========================================================================
    // Rename
    // ========================================================================

    #[test]
    fn test_scenario_rename_with_quoting() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("Plain")).unwrap();
        wb.new_sheet(Some("S")).unwrap();
        wb.set_cell_contents("Plain", "A1", Some("9")).unwrap();
        wb.set_cell_contents("S", "A1", Some("=Plain!A1")).unwrap();

        wb.rename_sheet("Plain", "Has Space").unwrap();
        assert_eq!(
            wb.get_cell_contents("S", "A1").unwrap(),
            Some("='Has Space'!A1".to_string())
        );
        assert_eq!(value(&wb, "S", "A1"), num("9"));
        assert_eq!(wb.list_sheets(), vec!["Has Space", "S"]);

        wb.rename_sheet("Has Space", "Plain").unwrap();
        assert_eq!(
            wb.get_cell_contents("S", "A1").unwrap(),
            Some("=Plain!A1".to_string())
        );
        assert_eq!(value(&wb, "S", "A1"), num("9"));
    }

    #[test]
    fn test_rename_validation() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("One")).unwrap();
        wb.new_sheet(Some("Two")).unwrap();

        assert!(matches!(
            wb.rename_sheet("One", ""),
            Err(WorkbookError::InvalidSheetName(_))
        ));
        assert!(matches!(
            wb.rename_sheet("One", "two"),
            Err(WorkbookError::DuplicateSheetName(_))
        ));
        assert!(matches!(
            wb.rename_sheet("Nope", "Three"),
            Err(WorkbookError::SheetNotFound(_))
        ));
    }

    #[test]
    fn test_rename_keeps_own_sheet_formulas_working() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("Data")).unwrap();
        wb.set_cell_contents("Data", "A1", Some("5")).unwrap();
        wb.set_cell_contents("Data", "B1", Some("=A1+1")).unwrap();
        // A self-qualified reference gets rewritten too
        wb.set_cell_contents("Data", "C1", Some("=Data!A1*2")).unwrap();

        wb.rename_sheet("Data", "Numbers").unwrap();
        assert_eq!(value(&wb, "Numbers", "B1"), num("6"));
        assert_eq!(value(&wb, "Numbers", "C1"), num("10"));
        assert_eq!(
            wb.get_cell_contents("Numbers", "C1").unwrap(),
            Some("=Numbers!A1*2".to_string())
        );

        wb.set_cell_contents("Numbers", "A1", Some("8")).unwrap();
        assert_eq!(value(&wb, "Numbers", "B1"), num("9"));
        assert_eq!(value(&wb, "Numbers", "C1"), num("16"));
    }

    #[test]
    fn test_rename_revives_references_to_new_name() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("S")).unwrap();
        wb.new_sheet(Some("Old")).unwrap();
        wb.set_cell_contents("Old", "A1", Some("3")).unwrap();
        wb.set_cell_contents("S", "A1", Some("=Target!A1")).unwrap();
        assert_eq!(kind(&wb, "S", "A1"), Some(ErrorKind::BadRef));

        wb.rename_sheet("Old", "Target").unwrap();
        assert_eq!(value(&wb, "S", "A1"), num("3"));
    }

    #[test]
    fn test_rename_round_trip_preserves_values() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("S")).unwrap();
        wb.new_sheet(Some("T Sheet")).unwrap();
        wb.set_cell_contents("T Sheet", "A1", Some("2")).unwrap();
        wb.set_cell_contents("S", "A1", Some("='T Sheet'!A1+1")).unwrap();
        wb.set_cell_contents("S", "B1", Some("=A1*10")).unwrap();

        let before: Vec<CellValue> = vec![
            value(&wb, "S", "A1"),
            value(&wb, "S", "B1"),
            value(&wb, "T Sheet", "A1"),
        ];

        let log = track_notifications(&mut wb);
        wb.rename_sheet("T Sheet", "Temp_Name").unwrap();
        wb.rename_sheet("Temp_Name", "T Sheet").unwrap();

        let after: Vec<CellValue> = vec![
            value(&wb, "S", "A1"),
            value(&wb, "S", "B1"),
            value(&wb, "T Sheet", "A1"),
        ];
        assert_eq!(before, after);
        // Values never changed, so observers stayed silent
        assert!(log.borrow().is_empty());
    }

    // ========================================================================
    // Copy sheet
    // ========================================================================

    #[test]
    fn test_copy_sheet_names_and_contents() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("Base")).unwrap();
        wb.set_cell_contents("Base", "A1", Some("2")).unwrap();
        wb.set_cell_contents("Base", "B1", Some("=A1*3")).unwrap();

        assert_eq!(wb.copy_sheet("Base").unwrap(), (1, "Base_1".to_string()));
        assert_eq!(wb.copy_sheet("base").unwrap(), (2, "Base_2".to_string()));

        assert_eq!(value(&wb, "Base_1", "B1"), num("6"));

        // Copies are independent of the original
        wb.set_cell_contents("Base", "A1", Some("10")).unwrap();
        assert_eq!(value(&wb, "Base", "B1"), num("30"));
        assert_eq!(value(&wb, "Base_1", "B1"), num("6"));
    }

    #[test]
    fn test_copy_sheet_notifies_all_copied_cells() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("Base")).unwrap();
        wb.set_cell_contents("Base", "A1", Some("1")).unwrap();
        wb.set_cell_contents("Base", "B2", Some("=A1")).unwrap();

        let log = track_notifications(&mut wb);
        wb.copy_sheet("Base").unwrap();
        assert_eq!(
            log.borrow().last().unwrap(),
            &vec![
                ("Base_1".to_string(), "A1".to_string()),
                ("Base_1".to_string(), "B2".to_string())
            ]
        );
    }

    #[test]
    fn test_copy_sheet_revives_references_to_copy_name() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("Base")).unwrap();
        wb.set_cell_contents("Base", "A1", Some("4")).unwrap();
        wb.set_cell_contents("Base", "C1", Some("=Base_1!A1")).unwrap();
        assert_eq!(kind(&wb, "Base", "C1"), Some(ErrorKind::BadRef));

        wb.copy_sheet("Base").unwrap();
        assert_eq!(value(&wb, "Base", "C1"), num("4"));
        // The copy's own C1 references Base_1 as well and sees the same value
        assert_eq!(value(&wb, "Base_1", "C1"), num("4"));
    }

    // ========================================================================
    // Move / copy cells
    // ========================================================================

    #[test]
    fn test_move_cells_basic() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();
        wb.set_cell_contents(&sheet, "A1", Some("1")).unwrap();

        wb.move_cells(&sheet, "A1", "A1", "A2", None).unwrap();
        assert_eq!(value(&wb, &sheet, "A1"), CellValue::Empty);
        assert_eq!(value(&wb, &sheet, "A2"), num("1"));
        assert_eq!(wb.get_cell_contents(&sheet, "A1").unwrap(), None);
    }

    #[test]
    fn test_scenario_copy_with_absolute_refs() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();
        wb.set_cell_contents(&sheet, "B1", Some("=$A$1+A1")).unwrap();

        wb.copy_cells(&sheet, "B1", "B1", "C2", None).unwrap();
        assert_eq!(
            wb.get_cell_contents(&sheet, "C2").unwrap(),
            Some("=$A$1+B2".to_string())
        );
        // Source is retained on copy
        assert_eq!(
            wb.get_cell_contents(&sheet, "B1").unwrap(),
            Some("=$A$1+A1".to_string())
        );
    }

    #[test]
    fn test_move_cells_rewrites_relative_refs() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();
        wb.set_cell_contents(&sheet, "A1", Some("5")).unwrap();
        wb.set_cell_contents(&sheet, "A2", Some("=A1*2")).unwrap();

        wb.move_cells(&sheet, "A2", "A2", "B5", None).unwrap();
        assert_eq!(
            wb.get_cell_contents(&sheet, "B5").unwrap(),
            Some("=B4*2".to_string())
        );
        // B4 is empty, so the moved formula sees zero
        assert_eq!(value(&wb, &sheet, "B5"), num("0"));
    }

    #[test]
    fn test_move_cells_region_with_overlap() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();
        wb.set_cell_contents(&sheet, "A1", Some("1")).unwrap();
        wb.set_cell_contents(&sheet, "A2", Some("2")).unwrap();
        wb.set_cell_contents(&sheet, "B1", Some("3")).unwrap();
        wb.set_cell_contents(&sheet, "B2", Some("4")).unwrap();

        // Shift the 2x2 block down one row onto itself
        wb.move_cells(&sheet, "A1", "B2", "A2", None).unwrap();
        assert_eq!(value(&wb, &sheet, "A1"), CellValue::Empty);
        assert_eq!(value(&wb, &sheet, "B1"), CellValue::Empty);
        assert_eq!(value(&wb, &sheet, "A2"), num("1"));
        assert_eq!(value(&wb, &sheet, "A3"), num("2"));
        assert_eq!(value(&wb, &sheet, "B2"), num("3"));
        assert_eq!(value(&wb, &sheet, "B3"), num("4"));
    }

    #[test]
    fn test_move_cells_corners_normalize() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();
        wb.set_cell_contents(&sheet, "A1", Some("1")).unwrap();
        wb.set_cell_contents(&sheet, "B2", Some("2")).unwrap();

        // Corners given bottom-right first
        wb.move_cells(&sheet, "B2", "A1", "C3", None).unwrap();
        assert_eq!(value(&wb, &sheet, "C3"), num("1"));
        assert_eq!(value(&wb, &sheet, "D4"), num("2"));
    }

    #[test]
    fn test_move_cells_to_other_sheet() {
        let mut wb = Workbook::new();
        wb.new_sheet(Some("Src")).unwrap();
        wb.new_sheet(Some("Dst")).unwrap();
        wb.set_cell_contents("Src", "A1", Some("1")).unwrap();
        wb.set_cell_contents("Src", "A2", Some("=A1+1")).unwrap();

        wb.move_cells("Src", "A1", "A2", "B1", Some("Dst")).unwrap();
        assert_eq!(value(&wb, "Src", "A1"), CellValue::Empty);
        assert_eq!(value(&wb, "Dst", "B1"), num("1"));
        // The unqualified reference now resolves on the destination sheet
        assert_eq!(value(&wb, "Dst", "B2"), num("2"));
    }

    #[test]
    fn test_move_cells_empty_source_clears_target() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();
        wb.set_cell_contents(&sheet, "A1", Some("1")).unwrap();
        wb.set_cell_contents(&sheet, "B2", Some("stale")).unwrap();

        // A2 is empty and lands on B2
        wb.move_cells(&sheet, "A1", "A2", "B1", None).unwrap();
        assert_eq!(value(&wb, &sheet, "B1"), num("1"));
        assert_eq!(value(&wb, &sheet, "B2"), CellValue::Empty);
    }

    #[test]
    fn test_move_cells_out_of_bounds_reference_becomes_ref_error() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();
        wb.set_cell_contents(&sheet, "B2", Some("=A1")).unwrap();

        wb.move_cells(&sheet, "B2", "B2", "A1", None).unwrap();
        assert_eq!(
            wb.get_cell_contents(&sheet, "A1").unwrap(),
            Some("=#REF!".to_string())
        );
        assert_eq!(kind(&wb, &sheet, "A1"), Some(ErrorKind::BadRef));
    }

    #[test]
    fn test_move_cells_target_must_fit_grid() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();
        wb.set_cell_contents(&sheet, "A1", Some("1")).unwrap();
        wb.set_cell_contents(&sheet, "B2", Some("2")).unwrap();

        assert!(matches!(
            wb.move_cells(&sheet, "A1", "B2", "NTO9999", None),
            Err(WorkbookError::InvalidLocation(_))
        ));
        // Nothing moved
        assert_eq!(value(&wb, &sheet, "A1"), num("1"));
    }

    #[test]
    fn test_move_round_trip_is_identity() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();
        wb.set_cell_contents(&sheet, "A1", Some("1")).unwrap();
        wb.set_cell_contents(&sheet, "A2", Some("=A1+1")).unwrap();

        wb.move_cells(&sheet, "A1", "A2", "C5", None).unwrap();
        wb.move_cells(&sheet, "C5", "C6", "A1", None).unwrap();
        assert_eq!(value(&wb, &sheet, "A1"), num("1"));
        assert_eq!(value(&wb, &sheet, "A2"), num("2"));
        assert_eq!(
            wb.get_cell_contents(&sheet, "A2").unwrap(),
            Some("=A1+1".to_string())
        );
    }

    #[test]
    fn test_move_cells_notifies_once() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();
        wb.set_cell_contents(&sheet, "C1", Some("9")).unwrap();

        let log = track_notifications(&mut wb);
        wb.move_cells(&sheet, "C1", "C1", "C2", None).unwrap();
        assert_eq!(log.borrow().len(), 1);
        assert_eq!(
            log.borrow().last().unwrap(),
            &vec![
                (sheet.clone(), "C1".to_string()),
                (sheet.clone(), "C2".to_string())
            ]
        );
    }

    // ========================================================================
    // Sort
    // ========================================================================

    #[test]
    fn test_sort_region_ascending() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();
        wb.set_cell_contents(&sheet, "A1", Some("2")).unwrap();
        wb.set_cell_contents(&sheet, "A2", Some("1")).unwrap();

        wb.sort_region(&sheet, "A1", "A2", &[1]).unwrap();
        assert_eq!(value(&wb, &sheet, "A1"), num("1"));
        assert_eq!(value(&wb, &sheet, "A2"), num("2"));
    }

    #[test]
    fn test_sort_region_descending() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();
        for (loc, contents) in [("A1", "1"), ("A2", "3"), ("A3", "2")] {
            wb.set_cell_contents(&sheet, loc, Some(contents)).unwrap();
        }

        wb.sort_region(&sheet, "A1", "A3", &[-1]).unwrap();
        assert_eq!(value(&wb, &sheet, "A1"), num("3"));
        assert_eq!(value(&wb, &sheet, "A2"), num("2"));
        assert_eq!(value(&wb, &sheet, "A3"), num("1"));
    }

    #[test]
    fn test_sort_region_is_stable_and_multi_key() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();
        // Rows: (b, 2), (a, 1), (b, 1), (a, 2)
        for (loc, contents) in [
            ("A1", "b"), ("B1", "2"),
            ("A2", "a"), ("B2", "1"),
            ("A3", "b"), ("B3", "1"),
            ("A4", "a"), ("B4", "2"),
        ] {
            wb.set_cell_contents(&sheet, loc, Some(contents)).unwrap();
        }

        // Sort by first column only: equal keys keep their original order
        wb.sort_region(&sheet, "A1", "B4", &[1]).unwrap();
        assert_eq!(value(&wb, &sheet, "A1"), text("a"));
        assert_eq!(value(&wb, &sheet, "B1"), num("1"));
        assert_eq!(value(&wb, &sheet, "A2"), text("a"));
        assert_eq!(value(&wb, &sheet, "B2"), num("2"));
        assert_eq!(value(&wb, &sheet, "A3"), text("b"));
        assert_eq!(value(&wb, &sheet, "B3"), num("2"));
        assert_eq!(value(&wb, &sheet, "A4"), text("b"));
        assert_eq!(value(&wb, &sheet, "B4"), num("1"));

        // Second key descending breaks the ties
        wb.sort_region(&sheet, "A1", "B4", &[1, -2]).unwrap();
        assert_eq!(value(&wb, &sheet, "B1"), num("2"));
        assert_eq!(value(&wb, &sheet, "B2"), num("1"));
        assert_eq!(value(&wb, &sheet, "B3"), num("2"));
        assert_eq!(value(&wb, &sheet, "B4"), num("1"));
    }

    #[test]
    fn test_sort_region_mixed_types_and_blanks() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();
        wb.set_cell_contents(&sheet, "A1", Some("word")).unwrap();
        wb.set_cell_contents(&sheet, "A2", Some("5")).unwrap();
        wb.set_cell_contents(&sheet, "A4", Some("TRUE")).unwrap();
        // A3 left blank

        wb.sort_region(&sheet, "A1", "A4", &[1]).unwrap();
        assert_eq!(value(&wb, &sheet, "A1"), CellValue::Empty);
        assert_eq!(value(&wb, &sheet, "A2"), num("5"));
        assert_eq!(value(&wb, &sheet, "A3"), text("word"));
        assert_eq!(value(&wb, &sheet, "A4"), CellValue::Bool(true));
    }

    #[test]
    fn test_sort_region_adjusts_moved_formulas() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();
        wb.set_cell_contents(&sheet, "A1", Some("9")).unwrap();
        wb.set_cell_contents(&sheet, "B1", Some("=A1")).unwrap();
        wb.set_cell_contents(&sheet, "A2", Some("3")).unwrap();
        wb.set_cell_contents(&sheet, "B2", Some("=A2")).unwrap();

        wb.sort_region(&sheet, "A1", "B2", &[1]).unwrap();
        // The rows swapped and each formula still points at its own row
        assert_eq!(value(&wb, &sheet, "A1"), num("3"));
        assert_eq!(wb.get_cell_contents(&sheet, "B1").unwrap(), Some("=A1".to_string()));
        assert_eq!(value(&wb, &sheet, "A2"), num("9"));
        assert_eq!(wb.get_cell_contents(&sheet, "B2").unwrap(), Some("=A2".to_string()));
    }

    #[test]
    fn test_sort_region_validates_columns() {
        let mut wb = Workbook::new();
        let (_, sheet) = wb.new_sheet(None).unwrap();
        wb.set_cell_contents(&sheet, "A1", Some("1")).unwrap();

        let bad_cols: [&[i32]; 4] = [&[], &[0], &[2], &[1, -1]];
        for cols in bad_cols {
            assert!(matches!(
                wb.sort_region(&sheet, "A1", "A2", cols),
                Err(WorkbookError::IndexOutOfRange(_))
            ));
        }
    }
}

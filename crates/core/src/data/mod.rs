mod io;

pub use io::{
    read_dosage_csv, read_phenotype_csv, write_association_csv, write_marker_summary_csv,
    write_matrix_csv, DosageTable,
};
